use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PolicyError {
    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(gatehouse::policy::load),
        help("Check that the file exists and is readable")
    )]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(gatehouse::policy::invalid),
        help("A policy needs a `version` node and one or more `rule` nodes with an effect and a `profiles` list")
    )]
    Invalid(String),

    #[error("Invalid rule `{rule}`: {message}")]
    #[diagnostic(
        code(gatehouse::policy::invalid_rule),
        help("Effects: allow, deny, require_server_session. Hours use HH:MM, days are weekday names (e.g. \"monday\")")
    )]
    InvalidRule { rule: String, message: String },

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(gatehouse::policy::kdl_parse),
        help("Check your KDL file syntax at https://kdl.dev")
    )]
    KdlParse(String),

    #[error("Timed out loading policy from `{0}`")]
    #[diagnostic(code(gatehouse::policy::timeout))]
    Timeout(String),
}

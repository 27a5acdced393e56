use miette::Diagnostic;
use thiserror::Error;

use crate::breakglass::BreakGlassError;
use crate::issuer::IssueError;
use crate::policy::PolicyError;
use crate::requests::RequestError;
use crate::server::ServerError;
use crate::session::SessionError;
use crate::storage::StoreError;

/// Top-level error for the binary and for wiring code that touches several
/// subsystems. Library operations return their own module errors.
#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(gatehouse::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(gatehouse::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(gatehouse::serde))]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Issue(#[from] IssueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    BreakGlass(#[from] BreakGlassError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Server(#[from] ServerError),

    #[error("Scheduler error: {0}")]
    #[diagnostic(code(gatehouse::scheduler))]
    Scheduler(String),

    #[error("{0}")]
    #[diagnostic(code(gatehouse::other))]
    Other(String),
}

//! gatehouse - policy-gated temporary cloud credentials
//!
//! Credentials are issued only when a declarative policy allows it (or an
//! approved request or break-glass event overrides a denial), and server-mode
//! sessions are tracked so they can be audited and revoked while running.
//! All modules are public so integration tests can drive them directly.

pub mod audit;
pub mod breakglass;
pub mod clock;
pub mod credentials;
pub mod entities;
pub mod errors;
pub mod identifiers;
pub mod issuer;
pub mod jobs;
pub mod notify;
pub mod overrides;
pub mod policy;
pub mod requests;
pub mod server;
pub mod session;
pub mod settings;
pub mod storage;

//! Declarative access policy: KDL parsing, validation, caching and the
//! first-match evaluator.

pub mod engine;
pub mod errors;
pub mod loader;
pub mod parser;
pub mod types;

pub use engine::evaluate;
pub use errors::PolicyError;
pub use loader::{CachedPolicyLoader, FilePolicyLoader, PolicyLoader};
pub use types::{Decision, Effect, Mode, Policy, Request, Rule};

//! Correlation identifiers.
//!
//! Every entity gatehouse persists (access requests, break-glass events,
//! server sessions) and every issuance request is keyed by a 16-character
//! lowercase hex id. Ids supplied from outside are checked with
//! [`validate_id`] before any store round-trip.

use rand::RngCore;

/// Length of every gatehouse identifier.
pub const ID_LEN: usize = 16;

/// Source-identity namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "gatehouse";

/// Generate a fresh 16-character lowercase hex id (64 bits of entropy).
pub fn new_id() -> String {
    let mut bytes = [0u8; ID_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Returns true when `id` is exactly 16 lowercase hex characters.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Check an externally supplied id, naming the field in the error.
pub fn validate_id(kind: &'static str, id: &str) -> Result<(), InvalidId> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(InvalidId {
            kind,
            value: id.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
#[error("invalid {kind} id `{value}`")]
#[diagnostic(
    code(gatehouse::invalid_id),
    help("ids are exactly 16 lowercase hexadecimal characters")
)]
pub struct InvalidId {
    pub kind: &'static str,
    pub value: String,
}

/// Format the source identity stamped on assumed-role sessions:
/// `<namespace>:<user>:<request_id>`.
pub fn source_identity(namespace: &str, user: &str, request_id: &str) -> String {
    format!("{namespace}:{user}:{request_id}")
}

/// Split a source identity back into `(namespace, user, request_id)`.
/// The request id must itself be well-formed.
pub fn parse_source_identity(value: &str) -> Option<(&str, &str, &str)> {
    let (namespace, rest) = value.split_once(':')?;
    let (user, request_id) = rest.rsplit_once(':')?;
    if namespace.is_empty() || user.is_empty() || !is_valid_id(request_id) {
        return None;
    }
    Some((namespace, user, request_id))
}

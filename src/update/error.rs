use thiserror::Error;

/// A version string that does not match the runtime's version pattern.
///
/// Malformed versions in the update document indicate an upstream contract
/// break, so this is always propagated rather than swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized runtime version string: {raw:?}")]
pub struct VersionParseError {
    raw: String,
}

impl VersionParseError {
    pub(crate) fn new(raw: &str) -> Self {
        Self { raw: raw.to_string() }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Another process holds the check lock. Expected and transient;
    /// callers retry with a jittered short delay.
    #[error("update check lock is held by another transaction")]
    LockUnavailable,

    #[error(transparent)]
    Version(#[from] VersionParseError),
}

/// Anything that escapes a single check cycle. Caught at the top of the
/// coordinator loop; never terminates it.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Version(#[from] VersionParseError),
}

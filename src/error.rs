//! Error kinds shared by the directory services.
//!
//! Request errors are caused by the caller and are reported back verbatim.
//! Internal errors are caused by the server and are always logged.

/// A validation failure of caller supplied input.
///
/// The display strings are the stable identifiers reported to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidInput {
    #[error("addressInvalid")]
    Address,
    #[error("addressTaken")]
    AddressTaken,
    #[error("latitudeInvalid")]
    Latitude,
    #[error("longitudeInvalid")]
    Longitude,
    #[error("nameMissing")]
    NameMissing,
    #[error("emailInvalid")]
    Email,
    #[error("contactTooLong")]
    ContactTooLong,
    #[error("detailsTooLong")]
    DetailsTooLong,
    #[error("pgpInvalid")]
    Pgp,
    #[error("invalidTime")]
    Time,
}

/// Error returned by the core directory operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller supplied malformed input.
    #[error(transparent)]
    Invalid(#[from] InvalidInput),
    /// No node with the requested address exists.
    #[error("no matching node")]
    NotFound,
    /// The verification token is unknown, already consumed or expired.
    #[error("invalid id")]
    UnknownToken,
    /// The requester is not allowed to act on the node.
    #[error("remote address does not match")]
    IdentityMismatch,
    /// Writes are disabled on this instance.
    #[error("database in readonly mode")]
    ReadOnly,
    /// A failure of the server, e.g. the store.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error was caused by the server rather than the caller.
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

/// Result type defaulting to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

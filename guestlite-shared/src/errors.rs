//! Error types for guestlite.

/// Result alias used across the guestlite crates.
pub type GuestResult<T> = Result<T, GuestError>;

/// Errors that can be produced by a guestlite handle.
#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    /// A backend string did not match any known backend.
    #[error("invalid backend: {0}")]
    InvalidBackend(String),

    /// A setter or operation received an out-of-range or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be applied (environment, directories, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation is not allowed in the handle's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The backend failed to bring up the appliance.
    #[error("launch failed: {0}")]
    Launch(String),

    /// The appliance channel failed or returned an error.
    #[error("connection error: {0}")]
    Connection(String),

    /// One or more shutdown steps failed. Every step still ran.
    #[error("shutdown failed: {}", .failures.join("; "))]
    Shutdown { failures: Vec<String> },

    /// The handle has already been closed.
    #[error("handle is closed")]
    Closed,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GuestError {
    /// True for the validation class of errors, which never change handle state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GuestError::InvalidBackend(_) | GuestError::InvalidArgument(_) | GuestError::Config(_)
        )
    }
}

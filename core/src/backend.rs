//! Authentication backend seam.
//!
//! The state machine drives this trait; the production implementation
//! is PAM (see the `pam` module, feature `pam`). Error codes are the
//! backend's own result codes and propagate into the process exit code,
//! so they are carried verbatim rather than re-encoded.

use thiserror::Error;

/// Result code a successfully concluded handle is ended with.
pub const BACKEND_SUCCESS: i32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub code: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(code: i32, message: impl Into<String>) -> BackendError {
        BackendError {
            code,
            message: message.into(),
        }
    }
}

/// One authentication handle, opened for the application name, target
/// user and prompter at construction and ended exactly once.
pub trait AuthBackend {
    /// One authentication attempt. The backend converses with the user
    /// through the prompter it was constructed with.
    fn authenticate(&mut self) -> Result<(), BackendError>;

    /// The identity the backend actually attached to the handle.
    fn authenticated_user(&mut self) -> Result<String, BackendError>;

    /// Account validity (expiry, lockout, access control).
    fn validate_account(&mut self) -> Result<(), BackendError>;

    fn open_session(&mut self) -> Result<(), BackendError>;

    fn close_session(&mut self) -> Result<(), BackendError>;

    /// Environment variables supplied by the opened session.
    fn session_env(&mut self) -> Vec<(String, String)>;

    /// Release the handle with the given result code. Called exactly
    /// once on every path, success and failure alike.
    fn end(&mut self, code: i32);
}

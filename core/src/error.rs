use thiserror::Error;

pub type Result<T> = std::result::Result<T, HelperError>;

/// Failure taxonomy for the helper. Every variant maps to a definite
/// process exit code; nothing here is ever surfaced as a panic.
#[derive(Debug, Error)]
pub enum HelperError {
    /// Missing, unsafe, or unparseable policy; unresolved program path.
    /// Never eligible for fallback.
    #[error("{0}")]
    Config(String),

    /// An invocation argument matched the policy deny list. Checked
    /// before the backend is ever contacted.
    #[error("permission denied")]
    DeniedArgument { argument: String },

    /// The authentication backend failed to start, authenticate,
    /// validate the account, or manage the session. `code` is the
    /// backend's own result code and becomes the exit code.
    #[error("{message}")]
    Auth { code: i32, message: String },

    /// The identity the backend attached to the handle does not match
    /// the policy target. Treated as a spoofing attempt; never
    /// eligible for fallback.
    #[error("authenticated user does not match requested user")]
    IdentityMismatch { authenticated: String, requested: String },

    /// A privilege transition did not verify. The process must not
    /// continue at an unintended privilege level.
    #[error("privilege transition failed: {0}")]
    Transition(&'static str),

    /// The target program could not be executed.
    #[error("failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl HelperError {
    /// Exit code reported for this failure. Backend failures propagate
    /// the backend's code; everything else is a plain nonzero exit.
    pub fn exit_code(&self) -> i32 {
        match self {
            HelperError::Auth { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }

    /// Result code handed to the backend's `end()` on this failure
    /// path. Identical to the exit code today, but kept separate so the
    /// two contracts can drift.
    pub fn backend_code(&self) -> i32 {
        self.exit_code()
    }
}

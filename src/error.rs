//! Error types for xcc.

use thiserror::Error;

/// Main error type for the compiler client.
///
/// The taxonomy matters for recovery: `Transport` kills the worker and is
/// retried by the pool facade, `Compile` is returned to the caller without a
/// retry, `BadCompiler` is fatal to pool startup.
#[derive(Error, Debug)]
pub enum XccError {
    /// A pipe or delegate-socket operation failed. The worker's pipes are no
    /// longer trustworthy; the only recovery is to kill and respawn it.
    #[error("{0}")]
    Transport(String),

    /// The external compiler rejected the source, replied with an unknown
    /// message type, or produced output the assembler could not accept.
    #[error("{0}")]
    Compile(String),

    /// The compiler subprocess could not be spawned or failed its version
    /// handshake.
    #[error("{0}")]
    BadCompiler(String),

    /// The pool is absent because configuration disabled it (no command, or
    /// zero workers).
    #[error("external compiler disabled by configuration")]
    Disabled,
}

impl XccError {
    /// Build a transport error from a failed operation and its OS error.
    pub(crate) fn transport(what: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport(format!("{}: {}", what, err))
    }
}

/// Result type alias for xcc operations.
pub type Result<T> = std::result::Result<T, XccError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_message_includes_cause() {
        let err = XccError::transport("error writing message", "broken pipe");
        assert_eq!(err.to_string(), "error writing message: broken pipe");
        assert!(matches!(err, XccError::Transport(_)));
    }

    #[test]
    fn test_disabled_display() {
        assert_eq!(
            XccError::Disabled.to_string(),
            "external compiler disabled by configuration"
        );
    }
}

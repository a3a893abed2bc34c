//! Client error types.

use std::time::Duration;

use ferrule_settings::SettingsError;

/// Errors surfaced by the client runtime.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The handshake was refused, locally by the endpoint's origin policy or
    /// remotely by the peer's HTTP response.
    #[error("handshake rejected ({status}): {reason}")]
    HandshakeRejected {
        /// HTTP-style status code (403 for origin rejection).
        status: u16,
        /// Human-readable reason.
        reason: String,
    },

    /// The handshake did not complete in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Socket/TLS/protocol failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Work was submitted to a pool that has been shut down.
    #[error("worker pool is shut down")]
    PoolShutdown,

    /// No worker thread could be started to run submitted work.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),

    /// The runtime was shut down or torn down after its idle timeout.
    #[error("client runtime is closed")]
    RuntimeClosed,

    /// The session is no longer open.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Invalid settings.
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl ClientError {
    /// Build a transport error from anything displayable.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// HTTP-style status of a handshake rejection.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HandshakeRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this is a policy/peer rejection rather than a failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::HandshakeRejected { .. })
    }

    /// Error category string for logs and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::HandshakeRejected { .. } => "handshake_rejected",
            Self::HandshakeTimeout(_) => "handshake_timeout",
            Self::Transport(_) => "transport",
            Self::PoolShutdown => "pool_shutdown",
            Self::WorkerSpawn(_) => "worker_spawn",
            Self::RuntimeClosed => "runtime_closed",
            Self::SessionClosed(_) => "session_closed",
            Self::Settings(_) => "settings",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_display_carries_status() {
        let err = ClientError::HandshakeRejected {
            status: 403,
            reason: "origin not allowed".into(),
        };
        assert_eq!(err.to_string(), "handshake rejected (403): origin not allowed");
        assert_eq!(err.status(), Some(403));
        assert!(err.is_rejection());
    }

    #[test]
    fn non_rejections_have_no_status() {
        assert_eq!(ClientError::PoolShutdown.status(), None);
        assert!(!ClientError::RuntimeClosed.is_rejection());
        assert_eq!(ClientError::transport("reset").status(), None);
    }

    #[test]
    fn categories() {
        assert_eq!(ClientError::PoolShutdown.category(), "pool_shutdown");
        assert_eq!(ClientError::RuntimeClosed.category(), "runtime_closed");
        assert_eq!(
            ClientError::HandshakeTimeout(Duration::from_secs(1)).category(),
            "handshake_timeout"
        );
        assert_eq!(ClientError::transport("x").category(), "transport");
        assert_eq!(ClientError::SessionClosed("s".into()).category(), "session_closed");
        assert_eq!(ClientError::WorkerSpawn("x".into()).category(), "worker_spawn");
    }

    #[test]
    fn settings_error_converts() {
        let err: ClientError = SettingsError::InvalidValue("maxPoolSize must be > 0".into()).into();
        assert_eq!(err.category(), "settings");
        assert!(err.to_string().contains("maxPoolSize"));
    }
}

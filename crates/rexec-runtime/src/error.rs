use std::time::Duration;

use crate::invocation::InvocationResult;
use crate::target::SessionKey;

/// Errors reported by a [`Transport`](crate::transport::Transport) adapter.
///
/// Adapters classify their failures into these kinds so the session layer can
/// decide whether a failure is fatal, transient or a deadline.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("operation not supported by transport: {0}")]
    Unsupported(&'static str),
}

/// Why a session ended up in the `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Auth,
    Timeout,
    Network,
}

/// Errors surfaced to callers of [`Session`](crate::session::Session) and
/// [`SessionPool`](crate::pool::SessionPool).
#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("authentication failed for {key}: {reason}")]
    Auth { key: SessionKey, reason: String },

    #[error("network error for {key}: {reason}")]
    Network { key: SessionKey, reason: String },

    #[error("connecting to {key} timed out after {timeout:?}")]
    ConnectTimeout { key: SessionKey, timeout: Duration },

    #[error("session for {0} is not connected")]
    NotConnected(SessionKey),

    #[error("session for {0} was closed")]
    SessionClosed(SessionKey),

    #[error("session for {0} is busy")]
    SessionBusy(SessionKey),

    #[error("command `{}` timed out after {timeout:?}", .partial.command)]
    InvocationTimeout {
        timeout: Duration,
        partial: Box<InvocationResult>,
    },

    #[error("command `{}` exited with code {}", .0.command, .0.exit_code)]
    NonZeroExit(Box<InvocationResult>),

    #[error("command `{}` was cancelled", .partial.command)]
    Cancelled { partial: Box<InvocationResult> },
}

impl ExecError {
    /// True when the error means the underlying connection is gone, and a
    /// fresh session may succeed where this one did not.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ExecError::NotConnected(_) | ExecError::SessionClosed(_) | ExecError::Network { .. }
        )
    }

    /// Output captured before the command failed, if any was produced.
    pub fn partial_result(&self) -> Option<&InvocationResult> {
        match self {
            ExecError::InvocationTimeout { partial, .. } | ExecError::Cancelled { partial } => {
                Some(&**partial)
            }
            ExecError::NonZeroExit(result) => Some(&**result),
            _ => None,
        }
    }

    pub(crate) fn from_transport(key: &SessionKey, err: TransportError) -> Self {
        match err {
            TransportError::Auth(reason) => ExecError::Auth {
                key: key.clone(),
                reason,
            },
            TransportError::Network(reason) => ExecError::Network {
                key: key.clone(),
                reason,
            },
            TransportError::Timeout(timeout) => ExecError::ConnectTimeout {
                key: key.clone(),
                timeout,
            },
            TransportError::Closed => ExecError::SessionClosed(key.clone()),
            TransportError::Unsupported(what) => ExecError::Network {
                key: key.clone(),
                reason: format!("transport does not support {what}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey {
            host: "example.com".to_string(),
            port: 22,
            user: "deploy".to_string(),
        }
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(ExecError::NotConnected(key()).is_connection_loss());
        assert!(ExecError::SessionClosed(key()).is_connection_loss());
        assert!(ExecError::Network {
            key: key(),
            reason: "reset".into()
        }
        .is_connection_loss());

        assert!(!ExecError::Auth {
            key: key(),
            reason: "denied".into()
        }
        .is_connection_loss());
        assert!(!ExecError::SessionBusy(key()).is_connection_loss());
        assert!(!ExecError::InvalidArgument("empty".into()).is_connection_loss());
    }

    #[test]
    fn test_transport_error_mapping() {
        let err = ExecError::from_transport(&key(), TransportError::Auth("denied".into()));
        assert!(matches!(err, ExecError::Auth { ref reason, .. } if reason == "denied"));

        let err = ExecError::from_transport(&key(), TransportError::Timeout(Duration::from_secs(3)));
        assert!(matches!(err, ExecError::ConnectTimeout { timeout, .. } if timeout == Duration::from_secs(3)));

        let err = ExecError::from_transport(&key(), TransportError::Closed);
        assert!(err.is_connection_loss());
    }

    #[test]
    fn test_error_messages_name_the_target() {
        let err = ExecError::SessionBusy(key());
        assert_eq!(err.to_string(), "session for deploy@example.com:22 is busy");
    }
}

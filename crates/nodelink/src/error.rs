//! Errors surfaced at the host API boundary.

use crate::project::ProjectError;
use crate::supervisor::SpawnError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("the Node.js engine has already been started")]
    AlreadyStarted,

    #[error("the Node.js engine has not been started")]
    NotStarted,

    /// Started but the engine has not sent its ready signal. Retry after
    /// `resolve_when_ready`.
    #[error("the Node.js engine is not ready yet")]
    NotReady,

    #[error("failed to resolve project: {0}")]
    Project(#[from] ProjectError),

    #[error("failed to spawn engine: {0}")]
    Spawn(#[from] SpawnError),

    #[error("failed to encode event payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The engine's transport writer has stopped (process exited or pipe broke).
    #[error("engine transport closed")]
    TransportClosed,

    #[error("readiness waiter dropped before the engine became ready")]
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_error_display() {
        assert_eq!(
            BridgeError::AlreadyStarted.to_string(),
            "the Node.js engine has already been started"
        );
        assert_eq!(
            BridgeError::NotStarted.to_string(),
            "the Node.js engine has not been started"
        );
        assert_eq!(
            BridgeError::NotReady.to_string(),
            "the Node.js engine is not ready yet"
        );
    }

    #[test]
    fn spawn_error_converts() {
        let err: BridgeError = SpawnError::Other("no node".to_string()).into();
        assert!(matches!(err, BridgeError::Spawn(_)));
    }
}

//! Server error types.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening endpoint could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The accept loop task panicked or was cancelled.
    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_the_address() {
        let err = ServerError::Bind {
            addr: ([127, 0, 0, 1], 8765).into(),
            source: std::io::ErrorKind::AddrInUse.into(),
        };
        assert!(err.to_string().starts_with("failed to bind 127.0.0.1:8765"));
    }

    #[tokio::test]
    async fn panicked_task_converts() {
        let joined = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        let err = ServerError::from(joined);
        assert!(matches!(err, ServerError::Task(_)));
    }
}

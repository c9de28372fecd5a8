use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("unknown connection operation: {0}")]
    UnknownOperation(String),
    #[error("invalid arguments for `{operation}`: {reason}")]
    InvalidArguments {
        operation: &'static str,
        reason: String,
    },
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("reactor error: {0}")]
    Reactor(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of [`PoolError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolErrorKind {
    /// Error raised by the database driver itself.
    Driver,
    /// The connection could not be acquired or is no longer usable.
    Connection,
    /// The requested unit of work was malformed or panicked.
    Operation,
    /// The pool or reactor was used outside of its lifecycle.
    Lifecycle,
    Config,
    Internal,
}

impl PoolError {
    /// Wrap an arbitrary driver error, keeping it as the error source.
    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PoolError::Driver(Box::new(err))
    }

    pub fn kind(&self) -> PoolErrorKind {
        match self {
            PoolError::DuckDb(_) | PoolError::Driver(_) => PoolErrorKind::Driver,
            PoolError::Connection(_) | PoolError::ConnectionClosed => PoolErrorKind::Connection,
            PoolError::UnknownOperation(_)
            | PoolError::InvalidArguments { .. }
            | PoolError::TaskPanicked(_) => PoolErrorKind::Operation,
            PoolError::PoolClosed | PoolError::Reactor(_) => PoolErrorKind::Lifecycle,
            PoolError::Config(_) => PoolErrorKind::Config,
            PoolError::Io(_) | PoolError::Internal(_) => PoolErrorKind::Internal,
        }
    }

    /// Whether this error means the thread's connection should be replaced
    /// before it is used again.
    pub fn is_connection_failure(&self) -> bool {
        self.kind() == PoolErrorKind::Connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("socket reset")]
    struct SocketReset;

    #[test]
    fn driver_errors_keep_their_source() {
        let err = PoolError::driver(SocketReset);
        assert_eq!(err.kind(), PoolErrorKind::Driver);
        assert_eq!(err.to_string(), "driver error: socket reset");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("socket reset"));
    }

    #[test]
    fn connection_failures_are_classified() {
        assert!(PoolError::Connection("gone".to_string()).is_connection_failure());
        assert!(PoolError::ConnectionClosed.is_connection_failure());
        assert!(!PoolError::PoolClosed.is_connection_failure());
        assert!(!PoolError::UnknownOperation("vacuum".to_string()).is_connection_failure());
    }

    #[test]
    fn lifecycle_errors_have_lifecycle_kind() {
        assert_eq!(PoolError::PoolClosed.kind(), PoolErrorKind::Lifecycle);
        assert_eq!(
            PoolError::Reactor("already running".to_string()).kind(),
            PoolErrorKind::Lifecycle
        );
    }
}

use thiserror::Error;

/// Errors produced by the forwarding engine.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("destination address is not available: {addr}: {source}")]
    DestinationUnavailable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("realm is no longer accepting connections")]
    RealmClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ForwardResult<T> = Result<T, ForwardError>;

/// Transport error kinds. No error of a single connection propagates to its
/// endpoint; these surface through results of endpoint-level operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot create transport socket ({0})")]
    SocketCreation(String),
    #[error("cannot close transport socket ({0})")]
    SocketShutdown(String),
    #[error("cannot write message to transport connection ({0})")]
    MessageWriter(String),
    #[error("cannot read message from transport connection ({0})")]
    MessageReader(String),
    #[error("transport message handler failed ({0})")]
    MessageHandler(String),
    #[error("transport message length exceeds the limit of {limit} bytes")]
    MessageLimitOverrun { limit: usize },
    #[error("cannot set the number of maximum connections lower than the currently active sessions")]
    ConnectionPoolMax,
    #[error("not supported on this operating system ({0})")]
    UnsupportedOs(String),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

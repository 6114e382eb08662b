use thiserror::Error;

/// Errors surfaced by the execution layer. Anything that reaches the build
/// driver is rendered into the edge's exit code and diagnostic output.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Castore(#[from] nimbus_castore::Error),

    #[error("grpc error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("channel error: {0}")]
    Channel(#[from] nimbus_reapi::ChannelError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("action cancelled")]
    Cancelled,

    #[error("remote execution failed: {0}")]
    Execution(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),
}

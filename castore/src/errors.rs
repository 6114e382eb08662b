use nimbus_reapi::proto::Digest;
use thiserror::Error;
use tonic::Status;

/// Errors surfaced by the castore layer.
///
/// Digest mismatches and missing blobs are always fatal to the action that
/// triggered them; gRPC failures reach here only after the retrying wrapper
/// has given up.
#[derive(Debug, Error)]
pub enum Error {
    #[error("expected digest '{expected}', but data has digest '{actual}'")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("expected {expected} bytes, but transferred {actual} bytes")]
    SizeMismatch { expected: i64, actual: i64 },

    #[error(
        "expected to upload {expected} bytes for {hash}, but server reports {committed} bytes committed"
    )]
    ShortWrite {
        hash: String,
        expected: i64,
        committed: i64,
    },

    #[error("{0} output blobs missing from CAS: {1}")]
    MissingBlobs(usize, String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("grpc error: {0}")]
    Grpc(#[from] Status),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build the missing-blob error from the offending hashes.
    pub fn missing_blobs(hashes: Vec<String>) -> Self {
        Error::MissingBlobs(hashes.len(), hashes.join(", "))
    }
}

//! Content-addressed storage for remote build execution.
//!
//! This crate owns everything between raw bytes on disk and blobs in a CAS:
//! digest computation (streaming, with a selectable hash family), the path
//! algebra used to place files inside an action's input root, the Merkle
//! directory builder, and the CAS client that moves blobs over the batch and
//! byte-stream RPCs while enforcing digest integrity end-to-end.

mod client;
mod digests;
mod errors;

pub mod fsutil;
pub mod merkle;
pub mod path;

pub use client::{BlobStatus, CasClient, DownloadedBlob, UploadRequest, UploadSource};
pub use digests::{DigestContext, DigestFunction, HASH_CHUNK_SIZE};
pub use errors::Error;

// The wire Digest is used pervasively; re-export it so callers don't need to
// depend on the proto crate for the common case.
pub use nimbus_reapi::proto::Digest;

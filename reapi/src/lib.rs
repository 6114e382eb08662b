//! Client-side plumbing for talking to a Remote Execution API cluster and to
//! a shared-build proxy.
//!
//! This crate carries the wire types (hand-rolled prost messages, so no
//! protoc is needed at build time), thin tonic clients for the services we
//! consume, gRPC channel construction from `grpc://` URLs, the
//! `RequestMetadata` header attached to every RPC, and the retrying
//! invocation wrapper shared by all callers.

mod channel;
mod metadata;
mod retry;

pub mod proto;

pub use channel::{channel_from_addr, channel_from_url, Error as ChannelError};
pub use metadata::MetadataInjector;
pub use retry::{RetryPolicy, Retrier};

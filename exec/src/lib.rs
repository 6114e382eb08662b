//! Off-node execution of build edges.
//!
//! Given edges whose commands look like compiler invocations, this crate
//! decides whether to run them locally, against a Remote Execution API
//! cluster, or through a shared-build proxy; it owns the compile-command
//! parser, the per-edge action construction, the remote execution client,
//! and the worker pools the build driver's event loop multiplexes.

pub mod action;
pub mod config;
pub mod context;
pub mod parser;
pub mod process;
pub mod reclient;
pub mod share;
pub mod spawn;
pub mod subprocess;

mod errors;

pub use errors::Error;

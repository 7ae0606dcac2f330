//! Off-thread text compression.
//!
//! [`codec`] defines the payload format, [`protocol`] the worker message
//! envelope, and [`service`] the async API that correlates requests with
//! worker responses.

pub mod codec;
pub mod protocol;
pub mod service;

pub use codec::{compress_text, decompress_text};
pub use protocol::{handle_request, serve, WorkerAction, WorkerRequest, WorkerResponse};
pub use service::{
    CompressionConfig, CompressionResult, CompressionService, ThreadSpawner, WorkerMode,
    WorkerSpawner,
};

//! IPC bridge between sharplet and the model worker process.
//!
//! - **protocol**: message types (WorkerRequest/WorkerResponse)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

//! Worker subprocess IPC.
//!
//! Out-of-process models run inside `flowserve worker` children that talk
//! newline-delimited JSON over stdin/stdout. `protocol` defines the frames,
//! `worker` is the child-side loop.

mod protocol;
mod worker;

pub use protocol::{decode_frame, encode_frame, ProtocolError, WorkerMessage, DEFAULT_FRAME_LIMIT};
pub use worker::{run_worker, serve, WorkerError, WorkerMode, WorkerOptions};

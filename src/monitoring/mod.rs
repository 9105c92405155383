//! Model monitoring side channel: sampled records pushed to an output stream.

mod pusher;
mod sink;

pub use pusher::{
    format_timestamp, pick_random_requests, LogEntry, LogPusher, LogPusherConfig, RecordContext,
    TIMESTAMP_FORMAT,
};
pub use sink::{FileStream, MemoryStream, OutputStream, PushError, PushedRecord};

//! Wire protocol between the delver host and its sandbox workers.
//!
//! Messages are newline-delimited JSON over the worker's stdio. The host
//! enforces the framing limits in [`limits`]; a violation fails the
//! connection closed rather than truncating or buffering without bound.

mod framing;
mod wire;

pub mod limits;

pub use framing::FramingError;
pub use framing::LineFramer;
pub use wire::ExecStatus;
pub use wire::ExecuteOutcome;
pub use wire::HostMessage;
pub use wire::WorkerMessage;

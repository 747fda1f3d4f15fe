//! Event-driven child process transport.
//!
//! Spawns a child process with its three standard streams redirected to
//! pipes and multiplexes them over a single-threaded, non-blocking
//! readiness loop. Application code supplies a [`ProcessProtocol`] and
//! receives an ordered sequence of lifecycle callbacks: `connection_made`
//! first, per-stream data and close notifications, and `process_ended`
//! exactly once after the child has been reaped *and* all three pipes
//! have closed.

mod child;
mod error;
mod event_loop;
mod pipe;
mod protocol;
mod spawn;
mod transport;

pub use child::{ChildState, ProcessHandle, ReapOutcome};
pub use error::{Result, TransportError};
pub use event_loop::{
  EventLoop, Interest, IoCallback, Readiness, ReapJob, ReapStatus, Task,
};
pub use pipe::PipeState;
pub use protocol::{CloseReason, ExitInfo, OutStream, ProcessProtocol};
pub use spawn::ProcessSpec;
pub use transport::{ProcessTransport, TransportCtl};

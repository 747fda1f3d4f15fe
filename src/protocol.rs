use std::fmt;
use std::io;
use std::process::ExitStatus;

use crate::transport::TransportCtl;

/// Which child output stream an event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutStream {
  Stdout,
  Stderr,
}

impl fmt::Display for OutStream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OutStream::Stdout => f.write_str("stdout"),
      OutStream::Stderr => f.write_str("stderr"),
    }
  }
}

/// Why a read pipe closed.
///
/// A non-EOF OS error closes the pipe the same way EOF does; the error
/// is carried here for diagnostics.
#[derive(Debug)]
pub enum CloseReason {
  Eof,
  Err(io::Error),
}

/// Exit outcome of the child: an exit code or the terminating signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitInfo {
  pub code: Option<i32>,
  pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
  fn from(status: ExitStatus) -> Self {
    #[cfg(unix)]
    let signal = {
      use std::os::unix::process::ExitStatusExt;
      status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
      code: status.code(),
      signal,
    }
  }
}

impl ExitInfo {
  pub fn success(&self) -> bool {
    self.code == Some(0)
  }
}

/// Callbacks driven by a [`ProcessTransport`](crate::ProcessTransport).
///
/// All methods default to no-ops; implement the ones you care about.
/// Guaranteed ordering for a completed lifecycle: `connection_made`
/// first, `process_ended` last and exactly once, and every
/// `stream_closed`/`input_closed` (each exactly once) strictly before
/// `process_ended`. The relative order of the three close callbacks
/// among themselves is unspecified.
///
/// Callbacks receive a [`TransportCtl`] so they can write to stdin or
/// request closing from inside the callback.
pub trait ProcessProtocol {
  /// The child has been spawned and the pipes are registered.
  fn connection_made(&mut self, ctl: &mut TransportCtl) {
    let _ = ctl;
  }

  /// Bytes arrived on stdout or stderr.
  fn data_received(
    &mut self,
    ctl: &mut TransportCtl,
    stream: OutStream,
    data: &[u8],
  ) {
    let _ = (ctl, stream, data);
  }

  /// A read pipe reached EOF or failed; it is now closed.
  fn stream_closed(
    &mut self,
    ctl: &mut TransportCtl,
    stream: OutStream,
    reason: CloseReason,
  ) {
    let _ = (ctl, stream, reason);
  }

  /// The stdin pipe has been closed (after draining, or because the
  /// child went away).
  fn input_closed(&mut self, ctl: &mut TransportCtl) {
    let _ = ctl;
  }

  /// The child has been reaped and all three pipes are closed.
  fn process_ended(&mut self, ctl: &mut TransportCtl, exit: ExitInfo) {
    let _ = (ctl, exit);
  }
}

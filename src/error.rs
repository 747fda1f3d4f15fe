use std::io;

/// Errors surfaced by the transport's own operations.
///
/// Read-side pipe errors are not represented here; they close the pipe
/// and reach the protocol through
/// [`CloseReason::Err`](crate::CloseReason::Err).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  /// The OS could not create the child process. No protocol callbacks
  /// fire after this.
  #[error("failed to spawn {executable}: {source}")]
  Spawn {
    executable: String,
    #[source]
    source: io::Error,
  },

  /// A write was attempted after stdin was closed or its close was
  /// requested.
  #[error("stdin is not writable")]
  NotWritable,

  /// The child could not be reaped. The transport can no longer
  /// deliver `process_ended`.
  #[error("failed to wait for child {pid}: {source}")]
  ChildWait {
    pid: u32,
    #[source]
    source: io::Error,
  },
}

pub type Result<T> = std::result::Result<T, TransportError>;

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::error::TransportError;
use crate::protocol::{CloseReason, OutStream};

/// Lifecycle of a pipe. Transitions are monotonic:
/// `Open -> Closing -> Closed` (write side) or `Open -> Closed` (read
/// side); a pipe is never reopened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeState {
  Open,
  Closing,
  Closed,
}

/// Read chunk per readiness notification.
pub const READ_CHUNK: usize = 32 * 1024;

/// Outcome of one non-blocking read attempt.
#[derive(Debug)]
pub enum ReadEvent {
  Data(Vec<u8>),
  Closed(CloseReason),
}

/// Read-direction pipe (child stdout or stderr).
pub struct ReadPipe {
  stream: OutStream,
  fd: Option<OwnedFd>,
  state: PipeState,
}

impl ReadPipe {
  pub fn new(stream: OutStream, fd: OwnedFd) -> Self {
    ReadPipe {
      stream,
      fd: Some(fd),
      state: PipeState::Open,
    }
  }

  pub fn is_closed(&self) -> bool {
    self.state == PipeState::Closed
  }

  /// Raw fd for poll registration. Only valid while open.
  pub fn raw_fd(&self) -> Option<RawFd> {
    self.fd.as_ref().map(|fd| fd.as_raw_fd())
  }

  /// Perform one non-blocking read. `None` means the OS would block;
  /// wait for the next readiness notification.
  pub fn poll_read(&mut self) -> Option<ReadEvent> {
    let fd = self.fd.as_ref()?;
    let mut buf = vec![0u8; READ_CHUNK];
    match rustix::io::read(fd, &mut buf[..]) {
      Ok(0) => {
        self.close();
        Some(ReadEvent::Closed(CloseReason::Eof))
      }
      Ok(n) => {
        buf.truncate(n);
        Some(ReadEvent::Data(buf))
      }
      Err(errno)
        if errno == rustix::io::Errno::AGAIN
          || errno == rustix::io::Errno::INTR =>
      {
        None
      }
      Err(errno) => {
        log::debug!("read error on child {}: {}", self.stream, errno);
        self.close();
        Some(ReadEvent::Closed(CloseReason::Err(io::Error::from(errno))))
      }
    }
  }

  /// Close the descriptor without waiting for EOF (early termination).
  pub fn close(&mut self) {
    self.fd = None;
    self.state = PipeState::Closed;
  }
}

/// Ordered buffer of pending stdin bytes. The front chunk may be
/// partially flushed; `offset` tracks how much of it already went out.
#[derive(Default)]
pub struct WriteQueue {
  pending: VecDeque<Vec<u8>>,
  offset: usize,
  close_requested: bool,
}

impl WriteQueue {
  pub fn push(&mut self, bytes: &[u8]) {
    self.pending.push_back(bytes.to_vec());
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn close_requested(&self) -> bool {
    self.close_requested
  }

  pub fn request_close(&mut self) {
    self.close_requested = true;
  }

  fn front(&self) -> Option<&[u8]> {
    self.pending.front().map(|chunk| &chunk[self.offset..])
  }

  fn advance(&mut self, n: usize) {
    self.offset += n;
    if let Some(chunk) = self.pending.front() {
      if self.offset >= chunk.len() {
        self.pending.pop_front();
        self.offset = 0;
      }
    }
  }

  #[cfg(test)]
  fn byte_len(&self) -> usize {
    self.pending.iter().map(|c| c.len()).sum::<usize>() - self.offset
  }
}

/// Outcome of one flush attempt on the write pipe.
#[derive(Debug)]
pub enum WriteEvent {
  /// Queue fully drained; writable interest can be dropped.
  Drained,
  /// The OS would block with bytes still pending.
  Blocked,
  /// The pipe is now closed: either the drain completed after a close
  /// request, or a write failed (e.g. EPIPE after child exit).
  Closed(Option<io::Error>),
}

/// Write-direction pipe (child stdin) plus its queue.
pub struct WritePipe {
  fd: Option<OwnedFd>,
  state: PipeState,
  queue: WriteQueue,
}

impl WritePipe {
  pub fn new(fd: OwnedFd) -> Self {
    WritePipe {
      fd: Some(fd),
      state: PipeState::Open,
      queue: WriteQueue::default(),
    }
  }

  pub fn state(&self) -> PipeState {
    self.state
  }

  pub fn is_closed(&self) -> bool {
    self.state == PipeState::Closed
  }

  pub fn raw_fd(&self) -> Option<RawFd> {
    self.fd.as_ref().map(|fd| fd.as_raw_fd())
  }

  pub fn queue_is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  /// Append bytes for delivery in submission order. Rejected once the
  /// pipe is closed or a close has been requested.
  pub fn enqueue(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
    if self.state != PipeState::Open {
      return Err(TransportError::NotWritable);
    }
    self.queue.push(bytes);
    Ok(())
  }

  /// Request closing: the descriptor is closed once the queue drains.
  pub fn request_close(&mut self) {
    if self.state == PipeState::Open {
      self.queue.request_close();
      self.state = PipeState::Closing;
    }
  }

  /// Flush as much as the OS accepts without blocking. A partially
  /// written chunk stays at the front of the queue.
  pub fn flush(&mut self) -> WriteEvent {
    let fd = match self.fd.as_ref() {
      Some(fd) => fd,
      None => return WriteEvent::Closed(None),
    };
    while let Some(chunk) = self.queue.front() {
      match rustix::io::write(fd, chunk) {
        Ok(n) => self.queue.advance(n),
        Err(errno)
          if errno == rustix::io::Errno::AGAIN
            || errno == rustix::io::Errno::INTR =>
        {
          return WriteEvent::Blocked;
        }
        Err(errno) => {
          log::debug!("write error on child stdin: {}", errno);
          self.close();
          return WriteEvent::Closed(Some(io::Error::from(errno)));
        }
      }
    }
    if self.queue.close_requested() {
      self.close();
      return WriteEvent::Closed(None);
    }
    WriteEvent::Drained
  }

  /// Close immediately, abandoning any pending bytes (used when the
  /// descriptor reports an error with nothing left to flush).
  pub fn close(&mut self) {
    self.fd = None;
    self.state = PipeState::Closed;
  }
}

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::child::{ProcessHandle, ReapOutcome};
use crate::error::{Result, TransportError};
use crate::event_loop::{EventLoop, Readiness, ReapStatus};
use crate::pipe::{PipeState, ReadEvent, ReadPipe, WriteEvent, WritePipe};
use crate::protocol::{CloseReason, OutStream, ProcessProtocol};
use crate::spawn::{spawn_child, ProcessSpec};

/// Orchestrates one child process: owns the three pipes, the write
/// queue and the process handle, and drives the bound
/// [`ProcessProtocol`] as pipes close and the child exits.
///
/// `process_ended` is gated on an explicit join: it fires only once the
/// child has been reaped *and* stdin, stdout and stderr have all
/// reached `Closed`. Exit observed at the OS level never preempts
/// buffered pipe data.
///
/// The handle is cheap to hold; keep it alive until `process_ended`
/// has fired, otherwise the transport's resources are released early.
pub struct ProcessTransport {
  inner: Rc<RefCell<Inner>>,
}

/// Borrow of the event loop plus the transport, handed to every
/// protocol callback so it can write or request closing in place.
pub struct TransportCtl<'a> {
  lp: &'a mut EventLoop,
  inner: &'a Rc<RefCell<Inner>>,
}

struct Inner {
  handle: ProcessHandle,
  stdin: WritePipe,
  stdout: ReadPipe,
  stderr: ReadPipe,
  protocol: Rc<RefCell<dyn ProcessProtocol>>,
  ended: bool,
  reap_failed: bool,
}

enum StdinStep {
  Idle,
  DropInterest(RawFd),
  Closed(RawFd, Option<io::Error>),
}

impl Inner {
  fn read_pipe_mut(&mut self, stream: OutStream) -> &mut ReadPipe {
    match stream {
      OutStream::Stdout => &mut self.stdout,
      OutStream::Stderr => &mut self.stderr,
    }
  }

  fn all_pipes_closed(&self) -> bool {
    self.stdin.is_closed()
      && self.stdout.is_closed()
      && self.stderr.is_closed()
  }

  /// One read attempt on `stream`. Returns the event plus the fd to
  /// deregister on close.
  fn read_step(
    &mut self,
    stream: OutStream,
  ) -> (Option<ReadEvent>, Option<RawFd>) {
    let pipe = self.read_pipe_mut(stream);
    if pipe.is_closed() {
      return (None, None);
    }
    let fd = pipe.raw_fd();
    (pipe.poll_read(), fd)
  }

  /// One stdin flush attempt driven by a writability/error
  /// notification.
  fn stdin_step(&mut self, ready: Readiness) -> StdinStep {
    let fd = match self.stdin.raw_fd() {
      Some(fd) => fd,
      None => return StdinStep::Idle,
    };
    if (ready.error || ready.hangup) && self.stdin.queue_is_empty() {
      // Child went away with nothing left to flush.
      self.stdin.close();
      return StdinStep::Closed(fd, None);
    }
    match self.stdin.flush() {
      WriteEvent::Drained => StdinStep::DropInterest(fd),
      WriteEvent::Blocked => StdinStep::Idle,
      WriteEvent::Closed(err) => StdinStep::Closed(fd, err),
    }
  }

  /// Close a still-open read pipe, returning its fd for deregistration.
  fn abort_read_pipe(&mut self, stream: OutStream) -> Option<RawFd> {
    let pipe = self.read_pipe_mut(stream);
    if pipe.is_closed() {
      return None;
    }
    let fd = pipe.raw_fd();
    pipe.close();
    fd
  }
}

/// Invoke one protocol callback. The protocol borrow is held only for
/// the duration of the call; transport state must not be borrowed by
/// the caller at this point.
fn call_protocol<F>(inner: &Rc<RefCell<Inner>>, lp: &mut EventLoop, f: F)
where
  F: FnOnce(&mut dyn ProcessProtocol, &mut TransportCtl),
{
  let protocol = inner.borrow().protocol.clone();
  let mut protocol = protocol.borrow_mut();
  let mut ctl = TransportCtl { lp, inner };
  f(&mut *protocol, &mut ctl);
}

fn on_readable(
  inner: &Rc<RefCell<Inner>>,
  lp: &mut EventLoop,
  stream: OutStream,
) {
  let (event, fd) = inner.borrow_mut().read_step(stream);
  match event {
    None => (),
    Some(ReadEvent::Data(data)) => {
      call_protocol(inner, lp, |p, ctl| p.data_received(ctl, stream, &data));
    }
    Some(ReadEvent::Closed(reason)) => {
      if let Some(fd) = fd {
        lp.deregister(fd);
      }
      call_protocol(inner, lp, |p, ctl| p.stream_closed(ctl, stream, reason));
      maybe_ended(inner, lp);
    }
  }
}

fn on_writable(
  inner: &Rc<RefCell<Inner>>,
  lp: &mut EventLoop,
  ready: Readiness,
) {
  let step = inner.borrow_mut().stdin_step(ready);
  match step {
    StdinStep::Idle => (),
    StdinStep::DropInterest(fd) => lp.set_writable(fd, false),
    StdinStep::Closed(fd, err) => {
      lp.deregister(fd);
      if let Some(err) = err {
        log::debug!("stdin closed after write error: {}", err);
      }
      call_protocol(inner, lp, |p, ctl| p.input_closed(ctl));
      maybe_ended(inner, lp);
    }
  }
}

fn on_reap(inner: &Rc<RefCell<Inner>>, lp: &mut EventLoop) -> ReapStatus {
  let outcome = inner.borrow_mut().handle.try_reap();
  match outcome {
    ReapOutcome::StillRunning => ReapStatus::Pending,
    ReapOutcome::Exited(_) => {
      maybe_ended(inner, lp);
      ReapStatus::Done
    }
    ReapOutcome::WaitFailed(source) => {
      let pid = inner.borrow().handle.pid();
      inner.borrow_mut().reap_failed = true;
      let err = TransportError::ChildWait { pid, source };
      log::error!(
        "{}; process_ended will never fire and the child may be leaked",
        err
      );
      ReapStatus::Done
    }
  }
}

/// The join condition: all three pipes closed and the child reaped.
/// Checked from every pipe-closing edge and from the reap edge.
fn maybe_ended(inner: &Rc<RefCell<Inner>>, lp: &mut EventLoop) {
  let exit = {
    let me = inner.borrow();
    if me.ended || me.reap_failed || !me.all_pipes_closed() {
      return;
    }
    match me.handle.exit_info() {
      Some(info) => info,
      None => return,
    }
  };
  inner.borrow_mut().ended = true;
  call_protocol(inner, lp, |p, ctl| p.process_ended(ctl, exit));
}

fn write_bytes(
  inner: &Rc<RefCell<Inner>>,
  lp: &mut EventLoop,
  bytes: &[u8],
) -> Result<()> {
  let fd = {
    let mut me = inner.borrow_mut();
    me.stdin.enqueue(bytes)?;
    me.stdin.raw_fd()
  };
  if let Some(fd) = fd {
    lp.set_writable(fd, true);
  }
  Ok(())
}

fn close_stdin(inner: &Rc<RefCell<Inner>>, lp: &mut EventLoop) {
  let fd = {
    let mut me = inner.borrow_mut();
    if me.stdin.state() != PipeState::Open {
      return;
    }
    me.stdin.request_close();
    me.stdin.raw_fd()
  };
  // Arm writability so the drain-then-close runs even with an empty
  // queue.
  if let Some(fd) = fd {
    lp.set_writable(fd, true);
  }
}

fn lose_connection(inner: &Rc<RefCell<Inner>>, lp: &mut EventLoop) {
  // Stdin rejects further writes immediately; the read pipes are
  // closed on the next tick so a protocol calling this from inside
  // data_received does not reenter itself.
  close_stdin(inner, lp);
  let weak = Rc::downgrade(inner);
  lp.schedule(Box::new(move |lp| {
    if let Some(inner) = weak.upgrade() {
      abort_read_pipes(&inner, lp);
    }
  }));
}

fn abort_read_pipes(inner: &Rc<RefCell<Inner>>, lp: &mut EventLoop) {
  for stream in [OutStream::Stdout, OutStream::Stderr] {
    let fd = inner.borrow_mut().abort_read_pipe(stream);
    if let Some(fd) = fd {
      lp.deregister(fd);
      call_protocol(inner, lp, |p, ctl| {
        p.stream_closed(ctl, stream, CloseReason::Eof)
      });
    }
  }
  maybe_ended(inner, lp);
}

impl ProcessTransport {
  /// Spawn `spec` with stdin/stdout/stderr piped, bind `protocol`, and
  /// register everything with `lp`. On success `connection_made` fires
  /// on the next tick, before any data or close callback. On failure
  /// no callback ever fires.
  pub fn spawn(
    lp: &mut EventLoop,
    spec: &ProcessSpec,
    protocol: Rc<RefCell<dyn ProcessProtocol>>,
  ) -> Result<ProcessTransport> {
    let spawned = spawn_child(spec).map_err(|source| TransportError::Spawn {
      executable: spec.prog.clone(),
      source,
    })?;

    let pid = spawned.child.id();
    let stdin = WritePipe::new(spawned.stdin);
    let stdout = ReadPipe::new(OutStream::Stdout, spawned.stdout);
    let stderr = ReadPipe::new(OutStream::Stderr, spawned.stderr);
    let stdin_fd = stdin.raw_fd();
    let stdout_fd = stdout.raw_fd();
    let stderr_fd = stderr.raw_fd();

    let inner = Rc::new(RefCell::new(Inner {
      handle: ProcessHandle::new(spawned.child),
      stdin,
      stdout,
      stderr,
      protocol,
      ended: false,
      reap_failed: false,
    }));

    for (fd, stream) in [
      (stdout_fd, OutStream::Stdout),
      (stderr_fd, OutStream::Stderr),
    ] {
      if let Some(fd) = fd {
        let weak = Rc::downgrade(&inner);
        lp.register_readable(
          fd,
          Rc::new(move |lp, _ready| {
            if let Some(inner) = weak.upgrade() {
              on_readable(&inner, lp, stream);
            }
          }),
        );
      }
    }

    if let Some(fd) = stdin_fd {
      let weak = Rc::downgrade(&inner);
      lp.register_writable(
        fd,
        Rc::new(move |lp, ready| {
          if let Some(inner) = weak.upgrade() {
            on_writable(&inner, lp, ready);
          }
        }),
      );
      // Nothing queued yet; stay in the poll set for error/hangup only.
      lp.set_writable(fd, false);
    }

    {
      let weak = Rc::downgrade(&inner);
      lp.schedule_reap(
        pid,
        Rc::new(move |lp| match weak.upgrade() {
          Some(inner) => on_reap(&inner, lp),
          None => ReapStatus::Done,
        }),
      );
    }

    {
      let weak = Rc::downgrade(&inner);
      lp.schedule(Box::new(move |lp| {
        if let Some(inner) = weak.upgrade() {
          call_protocol(&inner, lp, |p, ctl| p.connection_made(ctl));
        }
      }));
    }

    Ok(ProcessTransport { inner })
  }

  /// Queue bytes for the child's stdin, delivered in submission order.
  pub fn write(&self, lp: &mut EventLoop, bytes: &[u8]) -> Result<()> {
    write_bytes(&self.inner, lp, bytes)
  }

  /// Close stdin once all queued bytes have drained.
  pub fn close_stdin(&self, lp: &mut EventLoop) {
    close_stdin(&self.inner, lp);
  }

  /// Request closing of all pipes. No further `write` succeeds;
  /// inbound data already buffered by the OS may still be dropped
  /// unread.
  pub fn lose_connection(&self, lp: &mut EventLoop) {
    lose_connection(&self.inner, lp);
  }

  pub fn pid(&self) -> u32 {
    self.inner.borrow().handle.pid()
  }

  /// Whether `process_ended` has been delivered.
  pub fn has_ended(&self) -> bool {
    self.inner.borrow().ended
  }

  /// Whether reaping failed; if so `process_ended` will never fire.
  pub fn reap_failed(&self) -> bool {
    self.inner.borrow().reap_failed
  }

  pub fn stdin_state(&self) -> PipeState {
    self.inner.borrow().stdin.state()
  }
}

impl fmt::Debug for ProcessTransport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let me = self.inner.borrow();
    f.debug_struct("ProcessTransport")
      .field("pid", &me.handle.pid())
      .field("stdin", &me.stdin.state())
      .field("ended", &me.ended)
      .finish()
  }
}

impl TransportCtl<'_> {
  pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
    write_bytes(self.inner, self.lp, bytes)
  }

  pub fn close_stdin(&mut self) {
    close_stdin(self.inner, self.lp);
  }

  pub fn lose_connection(&mut self) {
    lose_connection(self.inner, self.lp);
  }

  pub fn pid(&self) -> u32 {
    self.inner.borrow().handle.pid()
  }
}

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

bitflags::bitflags! {
  /// Readiness kinds a source is polled for. A registered fd with an
  /// empty interest set stays in the poll set so errors and hangups on
  /// it are still observed.
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct Interest: u8 {
    const READABLE = 0b01;
    const WRITABLE = 0b10;
  }
}

/// What `poll(2)` reported for one source.
#[derive(Clone, Copy, Debug, Default)]
pub struct Readiness {
  pub readable: bool,
  pub writable: bool,
  pub error: bool,
  pub hangup: bool,
}

pub type IoCallback = Rc<dyn Fn(&mut EventLoop, Readiness)>;
pub type Task = Box<dyn FnOnce(&mut EventLoop)>;
pub type ReapJob = Rc<dyn Fn(&mut EventLoop) -> ReapStatus>;

/// Result of polling a reap job once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReapStatus {
  Pending,
  Done,
}

struct Source {
  fd: RawFd,
  interest: Interest,
  on_readable: Option<IoCallback>,
  on_writable: Option<IoCallback>,
}

struct Reaper {
  pid: u32,
  job: ReapJob,
}

/// Single-threaded cooperative readiness loop.
///
/// One [`iterate`](EventLoop::iterate) call is one scheduling tick:
/// run call-soon tasks, perform one `poll(2)`, dispatch ready
/// callbacks, then poll outstanding reap jobs. Callbacks may register
/// and deregister sources reentrantly.
pub struct EventLoop {
  sources: Vec<Source>,
  reapers: Vec<Reaper>,
  soon: VecDeque<Task>,
}

/// Poll timeout cap while reap jobs are outstanding, so child exits are
/// noticed without an fd becoming ready.
const REAP_POLL_MS: i32 = 20;

impl EventLoop {
  pub fn new() -> Self {
    EventLoop {
      sources: Vec::new(),
      reapers: Vec::new(),
      soon: VecDeque::new(),
    }
  }

  fn source_mut(&mut self, fd: RawFd) -> Option<&mut Source> {
    self.sources.iter_mut().find(|s| s.fd == fd)
  }

  fn source_entry(&mut self, fd: RawFd) -> &mut Source {
    let idx = match self.sources.iter().position(|s| s.fd == fd) {
      Some(idx) => idx,
      None => {
        self.sources.push(Source {
          fd,
          interest: Interest::empty(),
          on_readable: None,
          on_writable: None,
        });
        self.sources.len() - 1
      }
    };
    &mut self.sources[idx]
  }

  /// Register a callback for readability of `fd`.
  pub fn register_readable(&mut self, fd: RawFd, callback: IoCallback) {
    let source = self.source_entry(fd);
    source.interest |= Interest::READABLE;
    source.on_readable = Some(callback);
  }

  /// Register a callback for writability of `fd`.
  pub fn register_writable(&mut self, fd: RawFd, callback: IoCallback) {
    let source = self.source_entry(fd);
    source.interest |= Interest::WRITABLE;
    source.on_writable = Some(callback);
  }

  /// Toggle writable interest without dropping the registration. With
  /// interest off the fd remains polled for errors/hangup only.
  pub fn set_writable(&mut self, fd: RawFd, enabled: bool) {
    if let Some(source) = self.source_mut(fd) {
      if enabled {
        source.interest |= Interest::WRITABLE;
      } else {
        source.interest -= Interest::WRITABLE;
      }
    }
  }

  /// Remove `fd` from the poll set entirely.
  pub fn deregister(&mut self, fd: RawFd) {
    self.sources.retain(|s| s.fd != fd);
  }

  /// Run `task` at the start of the next tick, before polling.
  pub fn schedule(&mut self, task: Task) {
    self.soon.push_back(task);
  }

  /// Poll `job` once per tick until it reports [`ReapStatus::Done`].
  pub fn schedule_reap(&mut self, pid: u32, job: ReapJob) {
    self.reapers.push(Reaper { pid, job });
  }

  pub fn has_sources(&self) -> bool {
    !self.sources.is_empty()
  }

  /// One cooperative scheduling tick.
  pub fn iterate(&mut self, timeout: Option<Duration>) -> io::Result<()> {
    let tasks: Vec<Task> = self.soon.drain(..).collect();
    for task in tasks {
      task(self);
    }

    let mut fds: Vec<libc::pollfd> = self
      .sources
      .iter()
      .map(|s| {
        let mut events: libc::c_short = 0;
        if s.interest.contains(Interest::READABLE) {
          events |= libc::POLLIN;
        }
        if s.interest.contains(Interest::WRITABLE) {
          events |= libc::POLLOUT;
        }
        libc::pollfd {
          fd: s.fd,
          events,
          revents: 0,
        }
      })
      .collect();

    let mut timeout_ms = match timeout {
      Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
      None => -1,
    };
    if !self.reapers.is_empty() {
      timeout_ms = if timeout_ms < 0 {
        REAP_POLL_MS
      } else {
        timeout_ms.min(REAP_POLL_MS)
      };
    }
    if !self.soon.is_empty() {
      // A callback scheduled new work; do not sleep on it.
      timeout_ms = 0;
    }

    let rc = unsafe {
      libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms)
    };
    if rc < 0 {
      let err = io::Error::last_os_error();
      if err.kind() == io::ErrorKind::Interrupted {
        return Ok(());
      }
      return Err(err);
    }

    for pollfd in &fds {
      if pollfd.revents == 0 {
        continue;
      }
      if pollfd.revents & libc::POLLNVAL != 0 {
        log::warn!("fd {} is invalid; dropping registration", pollfd.fd);
        self.deregister(pollfd.fd);
        continue;
      }
      let ready = Readiness {
        readable: pollfd.revents & libc::POLLIN != 0,
        writable: pollfd.revents & libc::POLLOUT != 0,
        error: pollfd.revents & libc::POLLERR != 0,
        hangup: pollfd.revents & libc::POLLHUP != 0,
      };
      // A previous callback may have deregistered this fd.
      let (on_readable, on_writable) = match self.source_mut(pollfd.fd) {
        Some(source) => {
          (source.on_readable.clone(), source.on_writable.clone())
        }
        None => continue,
      };
      if ready.readable || ready.hangup || ready.error {
        if let Some(callback) = on_readable {
          callback(self, ready);
        }
      }
      if ready.writable || ready.hangup || ready.error {
        if let Some(callback) = on_writable {
          callback(self, ready);
        }
      }
    }

    let reapers = std::mem::take(&mut self.reapers);
    for reaper in reapers {
      match (reaper.job)(self) {
        ReapStatus::Pending => self.reapers.push(reaper),
        ReapStatus::Done => {
          log::debug!("reap job for pid {} finished", reaper.pid);
        }
      }
    }

    Ok(())
  }
}

impl Default for EventLoop {
  fn default() -> Self {
    EventLoop::new()
  }
}

#[cfg(test)]
mod tests {
  use std::cell::RefCell;
  use std::os::fd::AsRawFd;

  use super::*;

  #[test]
  fn schedule_runs_before_poll_dispatch() {
    let mut lp = EventLoop::new();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(vec![]));

    let (r, w) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)
      .expect("pipe");
    rustix::io::write(&w, b"x").expect("write");

    {
      let order = order.clone();
      lp.register_readable(
        r.as_raw_fd(),
        Rc::new(move |_lp, _ready| order.borrow_mut().push("readable")),
      );
    }
    {
      let order = order.clone();
      lp.schedule(Box::new(move |_lp| order.borrow_mut().push("task")));
    }

    lp.iterate(Some(Duration::from_millis(100))).unwrap();
    assert_eq!(*order.borrow(), vec!["task", "readable"]);
  }

  #[test]
  fn deregister_stops_dispatch() {
    let mut lp = EventLoop::new();
    let hits = Rc::new(RefCell::new(0));

    let (r, w) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)
      .expect("pipe");
    rustix::io::write(&w, b"x").expect("write");

    {
      let hits = hits.clone();
      lp.register_readable(
        r.as_raw_fd(),
        Rc::new(move |_lp, _ready| *hits.borrow_mut() += 1),
      );
    }
    lp.iterate(Some(Duration::from_millis(100))).unwrap();
    assert_eq!(*hits.borrow(), 1);

    lp.deregister(r.as_raw_fd());
    lp.iterate(Some(Duration::from_millis(10))).unwrap();
    assert_eq!(*hits.borrow(), 1);
  }

  #[test]
  fn writable_interest_toggles() {
    let mut lp = EventLoop::new();
    let hits = Rc::new(RefCell::new(0));

    let (_r, w) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)
      .expect("pipe");

    {
      let hits = hits.clone();
      lp.register_writable(
        w.as_raw_fd(),
        Rc::new(move |_lp, _ready| *hits.borrow_mut() += 1),
      );
    }
    lp.iterate(Some(Duration::from_millis(10))).unwrap();
    assert_eq!(*hits.borrow(), 1);

    lp.set_writable(w.as_raw_fd(), false);
    lp.iterate(Some(Duration::from_millis(10))).unwrap();
    assert_eq!(*hits.borrow(), 1);

    lp.set_writable(w.as_raw_fd(), true);
    lp.iterate(Some(Duration::from_millis(10))).unwrap();
    assert_eq!(*hits.borrow(), 2);
  }
}

use std::io;
use std::process::Child;

use crate::protocol::ExitInfo;

/// Child lifecycle as the transport sees it. Transitions
/// `Running -> Exited` exactly once, independent of pipe state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildState {
  Running,
  Exited(ExitInfo),
}

/// Outcome of one reap attempt.
#[derive(Debug)]
pub enum ReapOutcome {
  StillRunning,
  Exited(ExitInfo),
  WaitFailed(io::Error),
}

/// The spawned child: pid, running/exited state, exit outcome once
/// known. Reaped non-blockingly (`try_wait`) from the event loop.
pub struct ProcessHandle {
  pid: u32,
  child: Child,
  state: ChildState,
}

impl ProcessHandle {
  pub fn new(child: Child) -> Self {
    let pid = child.id();
    ProcessHandle {
      pid,
      child,
      state: ChildState::Running,
    }
  }

  pub fn pid(&self) -> u32 {
    self.pid
  }

  pub fn state(&self) -> ChildState {
    self.state
  }

  pub fn exit_info(&self) -> Option<ExitInfo> {
    match self.state {
      ChildState::Running => None,
      ChildState::Exited(info) => Some(info),
    }
  }

  /// One non-blocking wait. Records the exit outcome on the first
  /// successful reap; later calls just report it.
  pub fn try_reap(&mut self) -> ReapOutcome {
    if let ChildState::Exited(info) = self.state {
      return ReapOutcome::Exited(info);
    }
    match self.child.try_wait() {
      Ok(Some(status)) => {
        let info = ExitInfo::from(status);
        log::debug!(
          "child {} exited (code={:?} signal={:?})",
          self.pid,
          info.code,
          info.signal
        );
        self.state = ChildState::Exited(info);
        ReapOutcome::Exited(info)
      }
      Ok(None) => ReapOutcome::StillRunning,
      Err(err) => ReapOutcome::WaitFailed(err),
    }
  }
}

#[cfg(test)]
mod tests {
  use assert_matches::assert_matches;

  use super::*;
  use crate::spawn::{spawn_child, ProcessSpec};

  #[test]
  fn reap_records_exit_once() {
    let spec = ProcessSpec::new("sh").arg("-c").arg("exit 7");
    let spawned = spawn_child(&spec).expect("spawn");
    let mut handle = ProcessHandle::new(spawned.child);

    let info = loop {
      match handle.try_reap() {
        ReapOutcome::StillRunning => {
          std::thread::sleep(std::time::Duration::from_millis(5));
        }
        ReapOutcome::Exited(info) => break info,
        ReapOutcome::WaitFailed(err) => panic!("wait failed: {}", err),
      }
    };
    assert_eq!(info.code, Some(7));
    assert_eq!(info.signal, None);

    // Already reaped: the recorded outcome is returned, not ECHILD.
    assert_matches!(handle.try_reap(), ReapOutcome::Exited(again) => {
      assert_eq!(again, info);
    });
    assert_eq!(handle.state(), ChildState::Exited(info));
  }
}

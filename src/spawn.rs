use std::path::PathBuf;

/// What to run: executable, arguments, environment adjustments, and an
/// optional working directory. Env entries with a `None` value remove
/// the variable from the child's environment.
#[derive(Clone, Debug)]
pub struct ProcessSpec {
  pub prog: String,
  pub args: Vec<String>,
  pub env: Vec<(String, Option<String>)>,
  pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
  pub fn new<T: Into<String>>(prog: T) -> Self {
    ProcessSpec {
      prog: prog.into(),
      args: Vec::new(),
      env: Vec::new(),
      cwd: None,
    }
  }

  pub fn arg<T: Into<String>>(mut self, arg: T) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, T>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<String>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn env<K: Into<String>, V: Into<String>>(mut self, k: K, v: V) -> Self {
    self.env.push((k.into(), Some(v.into())));
    self
  }

  pub fn env_remove<K: Into<String>>(mut self, k: K) -> Self {
    self.env.push((k.into(), None));
    self
  }

  pub fn cwd<T: Into<PathBuf>>(mut self, cwd: T) -> Self {
    self.cwd = Some(cwd.into());
    self
  }
}

#[cfg(unix)]
mod unix {
  use std::io;
  use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
  use std::process::{Child, Command, Stdio};

  use rustix::fs::OFlags;

  use super::ProcessSpec;

  /// A freshly spawned child with the parent ends of its three stdio
  /// pipes, each switched to non-blocking mode.
  #[derive(Debug)]
  pub struct SpawnedChild {
    pub child: Child,
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
  }

  fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = rustix::fs::fcntl_getfl(fd)?;
    rustix::fs::fcntl_setfl(fd, flags | OFlags::NONBLOCK)?;
    Ok(())
  }

  /// Create the child with all three streams piped. Fails synchronously
  /// (missing executable, permission denied, resource exhaustion).
  pub fn spawn_child(spec: &ProcessSpec) -> io::Result<SpawnedChild> {
    let mut cmd = Command::new(&spec.prog);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
      match value {
        Some(value) => {
          cmd.env(key, value);
        }
        None => {
          cmd.env_remove(key);
        }
      }
    }
    if let Some(cwd) = &spec.cwd {
      cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    log::debug!("spawned {} as pid {}", spec.prog, child.id());

    // The handles are always present with piped stdio.
    let stdin = OwnedFd::from(
      child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("child stdin missing"))?,
    );
    let stdout = OwnedFd::from(
      child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout missing"))?,
    );
    let stderr = OwnedFd::from(
      child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr missing"))?,
    );

    set_nonblocking(stdin.as_fd())?;
    set_nonblocking(stdout.as_fd())?;
    set_nonblocking(stderr.as_fd())?;

    Ok(SpawnedChild {
      child,
      stdin,
      stdout,
      stderr,
    })
  }
}

#[cfg(unix)]
pub use unix::spawn_child;

#[cfg(test)]
mod tests {
  use assert_matches::assert_matches;

  use super::*;

  #[test]
  fn spawn_missing_executable_fails() {
    let spec = ProcessSpec::new("/nonexistent/definitely-not-a-binary");
    assert_matches!(spawn_child(&spec), Err(err) => {
      assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    });
  }

  #[test]
  fn spec_builder_accumulates() {
    let spec = ProcessSpec::new("ls")
      .arg("-l")
      .args(["a", "b"])
      .env("K", "v")
      .env_remove("GONE")
      .cwd("/tmp");
    assert_eq!(spec.args, vec!["-l", "a", "b"]);
    assert_eq!(spec.env.len(), 2);
    assert_eq!(spec.env[1], ("GONE".to_string(), None));
    assert_eq!(spec.cwd.as_deref(), Some(std::path::Path::new("/tmp")));
  }
}

//! Per-port pid files so `kill` and `status` can find running sessions.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    // kill(pid, 0) checks existence without sending a signal
    let rc = unsafe { nix::libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: it exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(nix::libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .with_context(|| format!("failed to signal pid {pid}"))
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<()> {
    anyhow::bail!("cannot signal pid {pid} on this platform")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub port: u16,
    pub pid: u32,
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRecorded,
    /// The recorded process was already gone; its file was removed.
    Stale { pid: u32 },
    Signalled { pid: u32 },
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    dir: PathBuf,
}

/// Removes the pid file when the session ends.
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %error, "failed to remove pid file");
            }
        }
    }
}

impl SessionRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.cc-bridge/sessions`
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir().context("cannot determine home directory")?;
        Ok(Self::new(home.join(".cc-bridge").join("sessions")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pid_path(&self, port: u16) -> PathBuf {
        self.dir.join(format!("{port}.pid"))
    }

    /// Record the current process for `port`, written atomically.
    pub fn register(&self, port: u16) -> Result<PidFileGuard> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.pid_path(port);
        let pid = std::process::id();
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed creating temp pid file in {}", self.dir.display()))?;
        write!(tmp, "{pid}")?;
        tmp.persist(&path)
            .with_context(|| format!("failed persisting pid file to {}", path.display()))?;
        tracing::debug!(pid = pid, path = %path.display(), "wrote session pid file");
        Ok(PidFileGuard { path })
    }

    pub fn recorded_pid(&self, port: u16) -> Option<u32> {
        std::fs::read_to_string(self.pid_path(port))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// All recorded sessions, sorted by port.
    pub fn list(&self) -> Vec<SessionEntry> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut sessions: Vec<SessionEntry> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let port = name.to_str()?.strip_suffix(".pid")?.parse().ok()?;
                let pid = self.recorded_pid(port)?;
                Some(SessionEntry {
                    port,
                    pid,
                    alive: is_pid_alive(pid),
                })
            })
            .collect();
        sessions.sort_by_key(|entry| entry.port);
        sessions
    }

    /// Send SIGTERM to the session on `port`. Stale records are cleaned up.
    pub fn kill(&self, port: u16) -> Result<KillOutcome> {
        let Some(pid) = self.recorded_pid(port) else {
            return Ok(KillOutcome::NotRecorded);
        };
        let outcome = if is_pid_alive(pid) {
            terminate(pid)?;
            KillOutcome::Signalled { pid }
        } else {
            KillOutcome::Stale { pid }
        };
        let _ = std::fs::remove_file(self.pid_path(port));
        Ok(outcome)
    }

    /// Drop records whose process is gone. Returns how many were removed.
    pub fn prune(&self) -> usize {
        self.list()
            .into_iter()
            .filter(|entry| !entry.alive)
            .filter(|entry| std::fs::remove_file(self.pid_path(entry.port)).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("failed to spawn 'true'");
        let pid = child.id();
        child.wait().expect("failed to wait on child");
        pid
    }

    #[test]
    fn is_pid_alive_for_self_and_dead_child() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(dead_pid()));
        assert!(!is_pid_alive(4_000_000));
    }

    #[test]
    fn register_list_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().join("sessions"));
        let guard = registry.register(19789).unwrap();
        assert_eq!(registry.recorded_pid(19789), Some(std::process::id()));
        assert_eq!(
            registry.list(),
            vec![SessionEntry {
                port: 19789,
                pid: std::process::id(),
                alive: true
            }]
        );

        guard.release();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn kill_cleans_stale_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        let pid = dead_pid();
        std::fs::write(dir.path().join("20001.pid"), pid.to_string()).unwrap();

        assert_eq!(registry.kill(20001).unwrap(), KillOutcome::Stale { pid });
        assert_eq!(registry.kill(20001).unwrap(), KillOutcome::NotRecorded);
    }

    #[test]
    fn kill_signals_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(dir.path().join("20002.pid"), child.id().to_string()).unwrap();

        assert_eq!(
            registry.kill(20002).unwrap(),
            KillOutcome::Signalled { pid: child.id() }
        );
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn prune_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        std::fs::write(dir.path().join("20003.pid"), dead_pid().to_string()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        assert_eq!(registry.prune(), 1);
        assert!(dir.path().join("notes.txt").exists());
    }
}

//! Pseudo-terminal hosting the supervised shell.

use std::{
    env,
    ffi::OsString,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use crate::error::{BridgeError, Result};

const READ_CHUNK: usize = 4096;
const OUTPUT_CHANNEL_DEPTH: usize = 256;

/// What to run inside the PTY.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl PtyCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows.max(1);
        self.cols = cols.max(1);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

pub struct PtySession {
    master: Box<dyn portable_pty::MasterPty + Send>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    child_pid: Option<u32>,
    reaped: Arc<AtomicBool>,
}

fn resolve_program(program: &str) -> String {
    if program.contains('/') {
        return program.to_string();
    }
    let path_env = env::var_os("PATH")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| OsString::from("/usr/local/bin:/usr/bin:/bin:/opt/homebrew/bin"));
    env::split_paths(&path_env)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .map(|candidate| candidate.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

fn resource(context: &str, error: impl std::fmt::Display) -> BridgeError {
    BridgeError::Resource(format!("{context}: {error}"))
}

impl PtySession {
    /// Start `command` in a fresh PTY. Output arrives on the returned
    /// receiver in read order; the channel closes when the child's side of
    /// the terminal does.
    pub fn spawn(command: &PtyCommand) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: command.rows,
                cols: command.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|error| resource("failed to open pty", error))?;

        let mut cmd = CommandBuilder::new(resolve_program(&command.program));
        cmd.args(&command.args);
        let cwd = match &command.cwd {
            Some(cwd) => cwd.clone(),
            None => env::current_dir().map_err(|error| resource("no working directory", error))?,
        };
        cmd.cwd(cwd);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|error| resource(&format!("failed to spawn `{}`", command.program), error))?;
        let child_pid = child.process_id();
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|error| resource("failed to clone pty reader", error))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|error| resource("failed to take pty writer", error))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tracing::info!(target = "cc_bridge::pty", pid = ?child_pid, program = %command.program, "pty child started");
        Ok((
            Self {
                master: pair.master,
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                child_pid,
                reaped: Arc::new(AtomicBool::new(false)),
            },
            rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child_pid
    }

    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        guard
            .write_all(bytes)
            .and_then(|()| guard.flush())
            .map_err(|error| resource("pty write failed", error))
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|error| resource("failed to resize pty", error))
    }

    /// Non-blocking exit check.
    pub fn has_exited(&self) -> bool {
        if self.reaped.load(Ordering::Relaxed) {
            return true;
        }

        match self.child.lock().try_wait() {
            Ok(Some(status)) => {
                tracing::info!(target = "cc_bridge::pty", pid = ?self.child_pid, status = ?status, "pty child exited");
                self.reaped.store(true, Ordering::Relaxed);
                return true;
            }
            Ok(None) => {}
            // ECHILD: someone else already reaped it.
            Err(_) => {
                self.reaped.store(true, Ordering::Relaxed);
                return true;
            }
        }

        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            if !crate::runtime::is_pid_alive(pid) {
                self.reaped.store(true, Ordering::Relaxed);
                return true;
            }
        }

        false
    }

    pub fn shutdown(&self) {
        if self.reaped.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
        tracing::debug!(target = "cc_bridge::pty", pid = ?self.child_pid, "pty child stopped");
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Current size of the controlling terminal, if stdin is one.
#[cfg(unix)]
pub fn terminal_size() -> Option<(u16, u16)> {
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ only writes into the provided winsize.
    let ret = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut size) };
    (ret == 0 && size.ws_row > 0 && size.ws_col > 0).then_some((size.ws_row, size.ws_col))
}

#[cfg(not(unix))]
pub fn terminal_size() -> Option<(u16, u16)> {
    None
}

pub fn default_shell() -> String {
    env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty() && Path::new(shell).is_absolute())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

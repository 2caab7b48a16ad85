//! System `ssh` client driven through a pseudo-terminal.
//!
//! `ssh` reads passwords and host-key answers from its controlling terminal,
//! so the child gets a PTY. A reader thread forwards PTY output into a tokio
//! channel; the channel closing is end-of-stream.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::transport::{Connector, ReadOutcome, Transport};

const READ_CHUNK: usize = 4096;
const OUTPUT_CHANNEL_DEPTH: usize = 64;

/// Opens sessions by spawning `<program> [args...] <user>@<target>`.
#[derive(Debug, Clone)]
pub struct SshConnector {
    program: String,
    args: Vec<String>,
}

impl SshConnector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.ssh_program.clone(), config.ssh_args.clone())
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new("ssh", Vec::new())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &str,
        username: &str,
    ) -> Result<Box<dyn Transport>, SessionError> {
        let mut args = self.args.clone();
        args.push(format!("{}@{}", username, target));
        let program = self.program.clone();
        let spawn_target = target.to_string();

        let transport = tokio::task::spawn_blocking(move || PtyTransport::spawn(&program, &args))
            .await
            .map_err(|e| SessionError::Connect {
                target: spawn_target.clone(),
                reason: e.to_string(),
            })?
            .map_err(|reason| SessionError::Connect {
                target: spawn_target,
                reason,
            })?;

        tracing::debug!(addr = %target, program = %self.program, "Spawned ssh client");
        Ok(Box::new(transport))
    }
}

/// PTY writes and child reaping block, so both run on the blocking pool.
pub struct PtyTransport {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    output: mpsc::Receiver<Vec<u8>>,
    /// `None` once terminated.
    child: Option<Box<dyn Child + Send + Sync>>,
    // Keeps the PTY open for the lifetime of the transport.
    _master: Box<dyn MasterPty + Send>,
}

impl PtyTransport {
    /// Spawn `program args...` on a fresh PTY. Blocking.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, String> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| e.to_string())?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        let child = pair.slave.spawn_command(cmd).map_err(|e| e.to_string())?;
        drop(pair.slave);

        let writer = pair.master.take_writer().map_err(|e| e.to_string())?;
        let mut reader = pair.master.try_clone_reader().map_err(|e| e.to_string())?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        std::thread::spawn(move || {
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

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            output: rx,
            child: Some(child),
            _master: pair.master,
        })
    }

    /// Kill and reap the child off the async worker threads. Also runs from
    /// `Drop`, possibly outside a runtime.
    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        let reap = move || {
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "Failed to kill ssh client");
            }
            if let Err(e) = child.wait() {
                tracing::debug!(error = %e, "Failed to reap ssh client");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(reap);
            }
            Err(_) => {
                std::thread::spawn(reap);
            }
        }
    }
}

#[async_trait]
impl Transport for PtyTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        let writer = self.writer.clone();
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\r');

        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            writer.write_all(&bytes).and_then(|_| writer.flush())
        })
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?
        .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn read(&mut self, timeout: Duration) -> Result<ReadOutcome, SessionError> {
        match tokio::time::timeout(timeout, self.output.recv()).await {
            Ok(Some(bytes)) => Ok(ReadOutcome::Data(bytes)),
            Ok(None) => Ok(ReadOutcome::EndOfStream),
            Err(_) => Ok(ReadOutcome::TimedOut),
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.terminate();
        Ok(())
    }
}

impl Drop for PtyTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}

//! In-memory remote side for exercising the automaton without a network.
//!
//! A script is the device's half of the conversation: text it emits, lines it
//! waits for, pauses, and hang-ups. Running off the end of a script leaves
//! the remote side silent, so every further read times out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::session::transport::{Connector, ReadOutcome, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Remote prints this text.
    Emit(String),
    /// Remote waits for exactly this line.
    Expect(String),
    /// Remote waits for any line.
    ExpectAny,
    /// Remote is busy for this long before continuing.
    Delay(Duration),
    /// Remote hangs up.
    Close,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    steps: Vec<ScriptStep>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(mut self, text: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Emit(text.into()));
        self
    }

    pub fn expect(mut self, line: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Expect(line.into()));
        self
    }

    pub fn expect_any(mut self) -> Self {
        self.steps.push(ScriptStep::ExpectAny);
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Delay(duration));
        self
    }

    pub fn close(mut self) -> Self {
        self.steps.push(ScriptStep::Close);
        self
    }

    /// A well-behaved device: optional host-key question, password, prompt
    /// `<hostname>#`, command echo and `output`, then hang-up on `exit`.
    pub fn device(
        hostname: &str,
        confirm_identity: bool,
        secret: &str,
        command: &str,
        output: &str,
    ) -> Self {
        let mut script = Self::new();
        if confirm_identity {
            script = script
                .emit("The authenticity of host can't be established.\r\nAre you sure you want to continue connecting (yes/no)? ")
                .expect("yes");
        }
        script
            .emit("Password: ")
            .expect(secret)
            .emit(format!("\r\n{}#", hostname))
            .expect(command)
            .emit(format!("{}\r\n{}\r\n{}#", command, output, hostname))
            .expect("exit")
            .close()
    }
}

/// Observations shared with the test that owns a scripted session.
#[derive(Debug, Clone, Default)]
pub struct ScriptLog {
    sent: Arc<Mutex<Vec<String>>>,
    released: Arc<AtomicBool>,
}

impl ScriptLog {
    /// Lines the client sent, in order.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Whether the transport was closed or dropped.
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct ScriptedTransport {
    steps: VecDeque<ScriptStep>,
    log: ScriptLog,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> (Self, ScriptLog) {
        let log = ScriptLog::default();
        let transport = Self {
            steps: script.steps.into(),
            log: log.clone(),
        };
        (transport, log)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        if self.log.released() {
            return Err(SessionError::Transport("session already closed".into()));
        }
        lock(&self.log.sent).push(line.to_string());
        match self.steps.front() {
            Some(ScriptStep::Expect(expected)) if expected == line => {
                self.steps.pop_front();
                Ok(())
            }
            Some(ScriptStep::Expect(expected)) => Err(SessionError::Transport(format!(
                "remote expected {:?}, got {:?}",
                expected, line
            ))),
            Some(ScriptStep::ExpectAny) => {
                self.steps.pop_front();
                Ok(())
            }
            // Typed ahead of the remote; it is ignored.
            _ => Ok(()),
        }
    }

    async fn read(&mut self, timeout: Duration) -> Result<ReadOutcome, SessionError> {
        let mut budget = timeout;
        loop {
            match self.steps.front_mut() {
                Some(ScriptStep::Emit(text)) => {
                    let text = std::mem::take(text);
                    self.steps.pop_front();
                    return Ok(ReadOutcome::Data(text.into_bytes()));
                }
                Some(ScriptStep::Delay(remaining)) => {
                    if *remaining <= budget {
                        let pause = *remaining;
                        self.steps.pop_front();
                        tokio::time::sleep(pause).await;
                        budget -= pause;
                    } else {
                        *remaining -= budget;
                        tokio::time::sleep(budget).await;
                        return Ok(ReadOutcome::TimedOut);
                    }
                }
                Some(ScriptStep::Close) => return Ok(ReadOutcome::EndOfStream),
                Some(ScriptStep::Expect(_)) | Some(ScriptStep::ExpectAny) | None => {
                    tokio::time::sleep(budget).await;
                    return Ok(ReadOutcome::TimedOut);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.log.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        self.log.released.store(true, Ordering::SeqCst);
    }
}

/// Connector that serves one script per target address.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    scripts: HashMap<String, Script>,
    connect_delay: Option<Duration>,
    logs: Mutex<Vec<(String, ScriptLog)>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(target.into(), script);
        self
    }

    /// Delay every connection attempt, for connect-timeout scenarios.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Log of the most recent session opened to `target`.
    pub fn log_for(&self, target: &str) -> Option<ScriptLog> {
        lock(&self.logs)
            .iter()
            .rev()
            .find(|(t, _)| t == target)
            .map(|(_, log)| log.clone())
    }

    pub fn connections(&self) -> usize {
        lock(&self.logs).len()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        target: &str,
        _username: &str,
    ) -> Result<Box<dyn Transport>, SessionError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        let script = self
            .scripts
            .get(target)
            .cloned()
            .ok_or_else(|| SessionError::Connect {
                target: target.to_string(),
                reason: "no route to host".to_string(),
            })?;
        let (transport, log) = ScriptedTransport::new(script);
        lock(&self.logs).push((target.to_string(), log));
        Ok(Box::new(transport))
    }
}

//! Finite-state driver for one interactive remote command session.
//!
//! The automaton walks a [`TransitionTable`]: every waiting state owns a list
//! of rules, each pairing a trigger (a pattern on the incoming stream,
//! end-of-stream, or the per-step timeout) with the input to send and the
//! next state. Control flow lives in the table, not in branches.
//!
//! ```text
//! Connecting -> AwaitingIdentityConfirmation --(yes/no)--> AwaitingCredential
//!                         |                                      |
//!                         +--------------(password:)-------------+
//!                                                                v
//!                AwaitingTermination <-- AwaitingOutput <-- AwaitingPrompt
//!                         |
//!                         v
//!                       Closed          (Failed is reachable from any state)
//! ```
//!
//! Captured output is everything between sending the command and the prompt
//! reappearing, command echo included. Stripping the echo is up to the caller.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use regex::bytes::Regex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::patterns;
use crate::session::transport::{Connector, ReadOutcome, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    AwaitingIdentityConfirmation,
    AwaitingCredential,
    AwaitingPrompt,
    AwaitingOutput,
    AwaitingTermination,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::AwaitingIdentityConfirmation => "awaiting-identity-confirmation",
            SessionState::AwaitingCredential => "awaiting-credential",
            SessionState::AwaitingPrompt => "awaiting-prompt",
            SessionState::AwaitingOutput => "awaiting-output",
            SessionState::AwaitingTermination => "awaiting-termination",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything one session run needs.
#[derive(Clone)]
pub struct SessionRequest {
    /// Identity reported with the output, usually the device hostname.
    pub device: String,
    pub target: String,
    pub username: String,
    pub secret: String,
    /// Regular expression marking the remote shell prompt.
    pub prompt: String,
    pub command: String,
    /// Applies to each wait, not to the whole run.
    pub step_timeout: Duration,
    pub affirmative: String,
    pub termination: String,
}

impl SessionRequest {
    /// Request using the configured credential and command, with the prompt
    /// `<hostname><prompt_suffix>`.
    pub fn for_device(config: &SessionConfig, hostname: &str, target: &str) -> Self {
        Self {
            device: hostname.to_string(),
            target: target.to_string(),
            username: config.username.clone(),
            secret: config.password.clone(),
            prompt: patterns::prompt_for_hostname(hostname, &config.prompt_suffix),
            command: config.command.clone(),
            step_timeout: config.step_timeout,
            affirmative: config.affirmative.clone(),
            termination: config.termination.clone(),
        }
    }
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("device", &self.device)
            .field("target", &self.target)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("prompt", &self.prompt)
            .field("command", &self.command)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOutput {
    pub device: String,
    pub target: String,
    pub output: String,
}

#[derive(Debug, Clone)]
enum Trigger {
    Pattern(Regex),
    EndOfStream,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    SendAffirmative,
    SendSecret,
    SendCommand,
    Capture,
    SendTermination,
    NoteUncleanExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Unreachable,
    CredentialRejected,
    NoCredentialPrompt,
    Disconnected,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Enter(SessionState),
    Reject(Failure),
}

#[derive(Debug, Clone)]
struct Rule {
    trigger: Trigger,
    actions: &'static [Action],
    next: Next,
}

impl Rule {
    fn new(trigger: Trigger, actions: &'static [Action], next: Next) -> Self {
        Self {
            trigger,
            actions,
            next,
        }
    }
}

#[derive(Debug)]
struct TransitionTable {
    rules: HashMap<SessionState, Vec<Rule>>,
}

impl TransitionTable {
    fn build(prompt: &Regex) -> Self {
        use Action::*;
        use Next::*;
        use SessionState::*;

        let identity = Trigger::Pattern(patterns::identity_confirmation());
        let credential = Trigger::Pattern(patterns::credential_prompt());
        let rejected = Trigger::Pattern(patterns::credential_rejected());
        let unreachable = Trigger::Pattern(patterns::connect_failure());
        let prompt = Trigger::Pattern(prompt.clone());

        let mut rules = HashMap::new();
        rules.insert(
            AwaitingIdentityConfirmation,
            vec![
                Rule::new(unreachable.clone(), &[], Reject(Failure::Unreachable)),
                Rule::new(identity, &[SendAffirmative], Enter(AwaitingCredential)),
                Rule::new(credential.clone(), &[SendSecret], Enter(AwaitingPrompt)),
                Rule::new(Trigger::EndOfStream, &[], Reject(Failure::NoCredentialPrompt)),
                Rule::new(Trigger::Timeout, &[], Reject(Failure::Timeout)),
            ],
        );
        rules.insert(
            AwaitingCredential,
            vec![
                Rule::new(unreachable, &[], Reject(Failure::Unreachable)),
                Rule::new(credential.clone(), &[SendSecret], Enter(AwaitingPrompt)),
                Rule::new(Trigger::EndOfStream, &[], Reject(Failure::NoCredentialPrompt)),
                Rule::new(Trigger::Timeout, &[], Reject(Failure::Timeout)),
            ],
        );
        rules.insert(
            AwaitingPrompt,
            vec![
                Rule::new(prompt.clone(), &[SendCommand], Enter(AwaitingOutput)),
                Rule::new(rejected, &[], Reject(Failure::CredentialRejected)),
                // Asked again: the secret was not accepted.
                Rule::new(credential, &[], Reject(Failure::CredentialRejected)),
                Rule::new(Trigger::EndOfStream, &[], Reject(Failure::CredentialRejected)),
                Rule::new(Trigger::Timeout, &[], Reject(Failure::Timeout)),
            ],
        );
        rules.insert(
            AwaitingOutput,
            vec![
                Rule::new(prompt, &[Capture, SendTermination], Enter(AwaitingTermination)),
                Rule::new(Trigger::EndOfStream, &[], Reject(Failure::Disconnected)),
                Rule::new(Trigger::Timeout, &[], Reject(Failure::Timeout)),
            ],
        );
        rules.insert(
            AwaitingTermination,
            vec![
                Rule::new(Trigger::EndOfStream, &[], Enter(Closed)),
                Rule::new(Trigger::Timeout, &[NoteUncleanExit], Enter(Closed)),
            ],
        );

        Self { rules }
    }

    fn rules(&self, state: SessionState) -> &[Rule] {
        self.rules.get(&state).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Accumulates unconsumed output between waits.
#[derive(Debug, Default)]
struct ExpectBuffer {
    pending: Vec<u8>,
}

impl ExpectBuffer {
    /// Wait until one of `rules` fires. Returns the rule and the text that
    /// preceded the match (or everything buffered, for end-of-stream and
    /// timeout).
    async fn expect<'r>(
        &mut self,
        transport: &mut dyn Transport,
        rules: &'r [Rule],
        timeout: Duration,
    ) -> Result<(&'r Rule, String), SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((rule, start, end)) = Self::earliest_match(&self.pending, rules) {
                let before = String::from_utf8_lossy(&self.pending[..start]).into_owned();
                self.pending.drain(..end);
                return Ok((rule, before));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = if remaining.is_zero() {
                ReadOutcome::TimedOut
            } else {
                transport.read(remaining).await?
            };

            let fallback = match outcome {
                ReadOutcome::Data(bytes) => {
                    self.pending.extend_from_slice(&bytes);
                    continue;
                }
                ReadOutcome::EndOfStream => {
                    rules.iter().find(|r| matches!(r.trigger, Trigger::EndOfStream))
                }
                ReadOutcome::TimedOut => {
                    rules.iter().find(|r| matches!(r.trigger, Trigger::Timeout))
                }
            };
            let rule = fallback.ok_or_else(|| {
                SessionError::Transport("no transition for stream event".to_string())
            })?;
            let before = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            return Ok((rule, before));
        }
    }

    /// Leftmost match across all pattern rules; ties go to the earlier rule.
    fn earliest_match<'r>(pending: &[u8], rules: &'r [Rule]) -> Option<(&'r Rule, usize, usize)> {
        let mut best: Option<(&Rule, usize, usize)> = None;
        for rule in rules {
            if let Trigger::Pattern(re) = &rule.trigger {
                if let Some(m) = re.find(pending) {
                    if best.map_or(true, |(_, start, _)| m.start() < start) {
                        best = Some((rule, m.start(), m.end()));
                    }
                }
            }
        }
        best
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Drives one session from connect to close.
#[derive(Debug)]
pub struct SessionAutomaton {
    request: SessionRequest,
    table: TransitionTable,
}

impl SessionAutomaton {
    /// Fails with [`SessionError::InvalidPattern`] if the prompt does not compile.
    pub fn new(request: SessionRequest) -> Result<Self, SessionError> {
        let prompt = patterns::compile_prompt(&request.prompt)?;
        let table = TransitionTable::build(&prompt);
        Ok(Self { request, table })
    }

    /// Run the session. The transport is closed on every path that opened it.
    pub async fn run(&self, connector: &dyn Connector) -> Result<SessionOutput, SessionError> {
        let req = &self.request;
        tracing::debug!(device = %req.device, addr = %req.target, state = %SessionState::Connecting, "Opening session");

        let connecting = connector.connect(&req.target, &req.username);
        let mut transport = match tokio::time::timeout(req.step_timeout, connecting).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e @ SessionError::Connect { .. })) => return Err(e),
            Ok(Err(other)) => {
                return Err(SessionError::Connect {
                    target: req.target.clone(),
                    reason: other.to_string(),
                })
            }
            Err(_) => {
                return Err(SessionError::Connect {
                    target: req.target.clone(),
                    reason: format!("no session within {}ms", req.step_timeout.as_millis()),
                })
            }
        };

        let outcome = self.drive(transport.as_mut()).await;
        if let Err(e) = transport.close().await {
            tracing::warn!(device = %req.device, error = %e, "Failed to close session");
        }

        match &outcome {
            Ok(out) => tracing::info!(device = %req.device, addr = %req.target, bytes = out.output.len(), "Session finished"),
            Err(e) => tracing::warn!(device = %req.device, addr = %req.target, error = %e, state = %SessionState::Failed, "Session failed"),
        }
        outcome
    }

    async fn drive(&self, transport: &mut dyn Transport) -> Result<SessionOutput, SessionError> {
        let req = &self.request;
        let mut stream = ExpectBuffer::default();
        let mut state = SessionState::AwaitingIdentityConfirmation;
        let mut captured = None;

        while state != SessionState::Closed {
            let rules = self.table.rules(state);
            let (rule, before) = stream.expect(transport, rules, req.step_timeout).await?;

            for action in rule.actions {
                match action {
                    Action::SendAffirmative => transport.send_line(&req.affirmative).await?,
                    Action::SendSecret => transport.send_line(&req.secret).await?,
                    Action::SendCommand => {
                        stream.clear();
                        transport.send_line(&req.command).await?;
                    }
                    Action::Capture => captured = Some(before.clone()),
                    Action::SendTermination => transport.send_line(&req.termination).await?,
                    Action::NoteUncleanExit => tracing::warn!(
                        device = %req.device,
                        timeout_ms = req.step_timeout.as_millis() as u64,
                        "Session did not close after termination command"
                    ),
                }
            }

            match rule.next {
                Next::Enter(next) => {
                    tracing::debug!(device = %req.device, from = %state, to = %next, "Session transition");
                    state = next;
                }
                Next::Reject(failure) => return Err(self.failure(failure, state)),
            }
        }

        let output = captured.ok_or_else(|| {
            SessionError::Transport("session closed before output was captured".to_string())
        })?;
        Ok(SessionOutput {
            device: req.device.clone(),
            target: req.target.clone(),
            output,
        })
    }

    fn failure(&self, failure: Failure, state: SessionState) -> SessionError {
        let target = self.request.target.clone();
        match failure {
            Failure::Unreachable => SessionError::Connect {
                target,
                reason: "ssh client could not reach the host".to_string(),
            },
            Failure::CredentialRejected => SessionError::Authentication {
                target,
                reason: "credential rejected".to_string(),
            },
            Failure::NoCredentialPrompt => SessionError::Authentication {
                target,
                reason: "session closed before a credential prompt".to_string(),
            },
            Failure::Disconnected => {
                SessionError::Transport(format!("session to {} closed in state {}", target, state))
            }
            Failure::Timeout => SessionError::Timeout {
                waiting_for: state.to_string(),
                timeout_ms: self.request.step_timeout.as_millis() as u64,
            },
        }
    }
}

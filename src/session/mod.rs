//! Interactive remote command sessions.
//!
//! - [`SessionAutomaton`]: table-driven state machine for one session
//! - [`Transport`] / [`Connector`]: the byte-stream seam it runs over
//! - [`SshConnector`]: system `ssh` under a pseudo-terminal
//! - [`ScriptedConnector`]: in-memory remote side for tests

pub mod automaton;
pub mod patterns;
pub mod pty;
pub mod scripted;
pub mod transport;

pub use automaton::{SessionAutomaton, SessionOutput, SessionRequest, SessionState};
pub use pty::SshConnector;
pub use scripted::{Script, ScriptLog, ScriptedConnector, ScriptedTransport};
pub use transport::{Connector, ReadOutcome, Transport};

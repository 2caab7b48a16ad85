use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;

/// Result of one bounded read from the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    EndOfStream,
    TimedOut,
}

/// A bidirectional interactive byte stream to a remote device.
#[async_trait]
pub trait Transport: Send {
    /// Send `line` followed by a line terminator.
    async fn send_line(&mut self, line: &str) -> Result<(), SessionError>;

    /// Wait at most `timeout` for the next chunk of output.
    async fn read(&mut self, timeout: Duration) -> Result<ReadOutcome, SessionError>;

    /// Release the underlying session. Must be safe to call more than once.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens transports to targets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &str,
        username: &str,
    ) -> Result<Box<dyn Transport>, SessionError>;
}

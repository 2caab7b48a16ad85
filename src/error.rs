use serde::Serialize;
use thiserror::Error;

use crate::scheduler::{TaskState, TaskToken};

/// Failures of one interactive remote session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Could not connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("Authentication failed on {target}: {reason}")]
    Authentication { target: String, reason: String },

    #[error("Timed out after {timeout_ms}ms in state {waiting_for}")]
    Timeout { waiting_for: String, timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid prompt pattern: {0}")]
    InvalidPattern(String),
}

/// Terminal failure recorded on a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Task exceeded its deadline of {0}ms")]
    Deadline(u64),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Work(String),
}

impl TaskError {
    /// Short machine-readable error code exposed to pollers.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Session(SessionError::Connect { .. }) => "connect",
            TaskError::Session(SessionError::Authentication { .. }) => "authentication",
            TaskError::Session(SessionError::Timeout { .. }) => "timeout",
            TaskError::Session(SessionError::Transport(_)) => "transport",
            TaskError::Session(SessionError::InvalidPattern(_)) => "validation",
            TaskError::Deadline(_) => "deadline",
            TaskError::Panicked(_) => "panicked",
            TaskError::Work(_) => "internal",
        }
    }
}

impl Serialize for TaskError {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("TaskError", 2)?;
        s.serialize_field("error", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Task not found: {0}")]
    NotFound(TaskToken),

    #[error("Task {0} already reached a terminal state")]
    AlreadyTerminal(TaskToken),

    #[error("Illegal transition for task {token}: {from} -> {to}")]
    IllegalTransition {
        token: TaskToken,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task registry is at capacity ({0} tasks)")]
    Full(usize),
}

/// Malformed input rejected before any task is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to read inventory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse inventory: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Error, Debug)]
pub enum DevpollError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DevpollError>;

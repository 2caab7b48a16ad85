pub mod registry;
pub mod status;
pub mod task;

pub use registry::TaskRegistry;
pub use status::{PollOutcome, StatusService};
pub use task::{Task, TaskState, TaskToken};

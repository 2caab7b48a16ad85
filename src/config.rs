use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// How sessions to devices are opened and what they run.
#[derive(Clone)]
pub struct SessionConfig {
    /// SSH client binary
    pub ssh_program: String,
    /// Extra arguments placed before `user@host`
    pub ssh_args: Vec<String>,
    pub username: String,
    pub password: String,
    /// Command run on each device
    pub command: String,
    /// Appended to the hostname to form the prompt, e.g. `R1` + `#`
    pub prompt_suffix: String,
    /// Answer to the host identity question
    pub affirmative: String,
    /// Command that ends the remote session
    pub termination: String,
    /// Bound on each individual wait
    pub step_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            ssh_args: Vec::new(),
            username: "admin".to_string(),
            password: "password".to_string(),
            command: "show version | i V".to_string(),
            prompt_suffix: "#".to_string(),
            affirmative: "yes".to_string(),
            termination: "exit".to_string(),
            step_timeout: Duration::from_secs(20),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("ssh_program", &self.ssh_program)
            .field("ssh_args", &self.ssh_args)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("command", &self.command)
            .field("prompt_suffix", &self.prompt_suffix)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    /// Remove a finished task once its result has been read.
    pub auto_delete_completed_tasks: bool,
    /// Registry capacity; submissions beyond it are refused.
    pub max_tasks: usize,
    /// Upper bound on sessions running at once. `None` = unbounded.
    pub max_concurrent_sessions: Option<usize>,
    /// End-to-end limit per task, on top of the per-step session timeout.
    pub task_deadline: Option<Duration>,
    /// Finished tasks older than this are swept even if never polled.
    pub completed_task_ttl: Option<Duration>,
    pub sweep_interval: Duration,
    pub session: SessionConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:5000"
                .parse()
                .expect("default listen address is valid"),
            auto_delete_completed_tasks: true,
            max_tasks: 10_000,
            max_concurrent_sessions: None,
            task_deadline: None,
            completed_task_ttl: None,
            sweep_interval: Duration::from_secs(60),
            session: SessionConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_auto_delete(mut self, enabled: bool) -> Self {
        self.auto_delete_completed_tasks = enabled;
        self
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn with_concurrency_limit(mut self, max_sessions: usize) -> Self {
        self.max_concurrent_sessions = Some(max_sessions);
        self
    }

    pub fn with_task_deadline(mut self, deadline: Duration) -> Self {
        self.task_deadline = Some(deadline);
        self
    }

    pub fn with_completed_task_ttl(mut self, ttl: Duration) -> Self {
        self.completed_task_ttl = Some(ttl);
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_default() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.ssh_program, "ssh");
        assert!(cfg.ssh_args.is_empty());
        assert_eq!(cfg.command, "show version | i V");
        assert_eq!(cfg.prompt_suffix, "#");
        assert_eq!(cfg.affirmative, "yes");
        assert_eq!(cfg.termination, "exit");
        assert_eq!(cfg.step_timeout, Duration::from_secs(20));
    }

    #[test]
    fn session_config_debug_hides_password() {
        let cfg = SessionConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn service_config_default() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:5000");
        assert!(cfg.auto_delete_completed_tasks);
        assert_eq!(cfg.max_tasks, 10_000);
        assert!(cfg.max_concurrent_sessions.is_none());
        assert!(cfg.task_deadline.is_none());
        assert!(cfg.completed_task_ttl.is_none());
    }

    #[test]
    fn service_config_builders() {
        let addr: SocketAddr = "10.0.0.1:8080".parse().unwrap();
        let cfg = ServiceConfig::new(addr)
            .with_auto_delete(false)
            .with_max_tasks(5)
            .with_concurrency_limit(2)
            .with_task_deadline(Duration::from_secs(90))
            .with_completed_task_ttl(Duration::from_secs(600));
        assert_eq!(cfg.listen_addr, addr);
        assert!(!cfg.auto_delete_completed_tasks);
        assert_eq!(cfg.max_tasks, 5);
        assert_eq!(cfg.max_concurrent_sessions, Some(2));
        assert_eq!(cfg.task_deadline, Some(Duration::from_secs(90)));
        assert_eq!(cfg.completed_task_ttl, Some(Duration::from_secs(600)));
    }
}

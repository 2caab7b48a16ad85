use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use devpoll::config::{ServiceConfig, SessionConfig};
use devpoll::inventory::StaticInventory;
use devpoll::service::Service;
use devpoll::session::{SessionAutomaton, SessionRequest, SshConnector};
use devpoll::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "devpoll")]
#[command(version)]
#[command(about = "Retrieve device command output asynchronously over interactive sessions")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the HTTP service
    Serve(ServeArgs),

    /// Run one session in the foreground and print its output
    Probe(ProbeArgs),
}

// =============================================================================
// Shared session arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SessionArgs {
    /// Username for device sessions
    #[arg(long, default_value = "admin")]
    username: String,

    /// Password for device sessions
    #[arg(long, env = "DEVPOLL_PASSWORD", default_value = "password", hide_env_values = true)]
    password: String,

    /// Command to run on the device
    #[arg(long, default_value = "show version | i V")]
    device_command: String,

    /// Suffix appended to the hostname to form the prompt
    #[arg(long, default_value = "#")]
    prompt_suffix: String,

    /// Timeout for each wait within a session, in seconds
    #[arg(long, default_value = "20")]
    step_timeout_secs: u64,

    /// SSH client binary
    #[arg(long, default_value = "ssh")]
    ssh_program: String,

    /// Extra argument for the SSH client (repeatable)
    #[arg(long = "ssh-arg")]
    ssh_args: Vec<String>,
}

impl SessionArgs {
    fn into_config(self) -> SessionConfig {
        SessionConfig {
            ssh_program: self.ssh_program,
            ssh_args: self.ssh_args,
            username: self.username,
            password: self.password,
            command: self.device_command,
            prompt_suffix: self.prompt_suffix,
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            ..SessionConfig::default()
        }
    }
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "5000")]
    port: u16,

    /// JSON file with the device inventory
    #[arg(long)]
    inventory: PathBuf,

    /// Keep finished tasks after their result has been read
    #[arg(long)]
    no_auto_delete: bool,

    /// Maximum number of tracked tasks
    #[arg(long, default_value = "10000")]
    max_tasks: usize,

    /// Maximum number of sessions running at once
    #[arg(long)]
    max_concurrent_sessions: Option<usize>,

    /// End-to-end deadline per task, in seconds
    #[arg(long)]
    task_deadline_secs: Option<u64>,

    /// Drop finished tasks not polled within this many seconds
    #[arg(long)]
    completed_task_ttl_secs: Option<u64>,

    /// How often to sweep expired tasks, in seconds
    #[arg(long, default_value = "60")]
    sweep_interval_secs: u64,

    #[command(flatten)]
    session: SessionArgs,
}

// =============================================================================
// Probe Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Management address of the device
    #[arg(long)]
    host: String,

    /// Device hostname, used to build the prompt
    #[arg(long)]
    hostname: String,

    #[command(flatten)]
    session: SessionArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Serve(serve) => run_server(serve).await,
        Commands::Probe(probe) => run_probe(probe).await,
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let inventory = StaticInventory::load(&args.inventory)?;
    if inventory.is_empty() {
        tracing::warn!(path = %args.inventory.display(), "Inventory is empty");
    }

    let session = args.session.into_config();
    let connector = SshConnector::from_config(&session);

    let mut config = ServiceConfig::new(listen_addr)
        .with_auto_delete(!args.no_auto_delete)
        .with_max_tasks(args.max_tasks)
        .with_session(session);
    config.sweep_interval = Duration::from_secs(args.sweep_interval_secs.max(1));
    if let Some(limit) = args.max_concurrent_sessions {
        config = config.with_concurrency_limit(limit);
    }
    if let Some(secs) = args.task_deadline_secs {
        config = config.with_task_deadline(Duration::from_secs(secs));
    }
    if let Some(secs) = args.completed_task_ttl_secs {
        config = config.with_completed_task_ttl(Duration::from_secs(secs));
    }

    let shutdown = install_shutdown_handler();
    let service = Service::new(config, Arc::new(inventory), Arc::new(connector));
    service.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Probe Implementation
// =============================================================================

async fn run_probe(args: ProbeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let session = args.session.into_config();
    let connector = SshConnector::from_config(&session);
    let request = SessionRequest::for_device(&session, &args.hostname, &args.host);
    let automaton = SessionAutomaton::new(request)?;

    let output = automaton.run(&connector).await?;
    println!("{}", output.output);
    Ok(())
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(version)]
#[command(about = "Bridge sandboxed pages to privileged background workers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve pages on a Unix socket until interrupted
    Host(HostArgs),

    /// Call a named channel on a running host
    Invoke(InvokeArgs),

    /// Run a worker in-process, posting stdin lines and printing its events
    Worker(WorkerArgs),
}

#[derive(Args)]
pub struct HostArgs {
    /// Socket path to listen on
    #[arg(long, env = "FERRY_SOCKET")]
    pub socket: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args)]
pub struct InvokeArgs {
    /// Socket path of the running host
    #[arg(long, env = "FERRY_SOCKET")]
    pub socket: PathBuf,

    /// Channel name, e.g. `ping` or `execCommands`
    pub channel: String,

    /// Arguments; each is parsed as JSON, falling back to a plain string
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Args)]
pub struct WorkerArgs {
    /// Worker script path or URL
    pub source: String,

    /// Send the file contents instead of its path
    #[arg(long)]
    pub inline: bool,

    /// Argument passed to the worker script (can be repeated)
    #[arg(long = "argv")]
    pub argv: Vec<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Host settings shared by the commands that run workers
#[derive(Args)]
pub struct CommonArgs {
    /// Interpreter used to run worker scripts
    #[arg(long)]
    pub worker_program: Option<String>,

    /// Extra interpreter argument placed before the script (can be repeated)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,

    /// Directory for scripts decoded from inline sources
    #[arg(long)]
    pub worker_dir: Option<PathBuf>,

    /// Environment variable to set (KEY=VALUE, can be repeated)
    #[arg(long = "env", short = 'e')]
    pub envs: Vec<String>,

    /// Directory to prepend to PATH (can be repeated)
    #[arg(long = "path")]
    pub path_prepend: Vec<PathBuf>,

    /// Fetch timeout in seconds
    #[arg(long)]
    pub fetch_timeout: Option<u64>,

    /// Ignore proxy settings from the environment for fetch
    #[arg(long)]
    pub no_system_proxy: bool,
}

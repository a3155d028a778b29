use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// drubatch - resumable batch execution engine
#[derive(Parser, Debug)]
#[command(name = "drubatch")]
#[command(about = "Run long batches across as many worker processes as memory requires")]
#[command(version)]
pub struct Cli {
    /// Directory holding persisted batches and queues
    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Memory ceiling per worker invocation (e.g. 512M, 2G, -1 for unlimited)
    #[arg(long, global = true, value_name = "SIZE", allow_hyphen_values = true)]
    pub memory_limit: Option<String>,

    /// JSON configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a batch definition and drive it to completion
    Run {
        /// Path to the batch definition JSON
        definition: PathBuf,

        /// Run worker invocations inside this process instead of spawning
        #[arg(long)]
        in_process: bool,

        /// Identity forwarded to every worker invocation
        #[arg(long)]
        actor: Option<String>,
    },
    /// Run one worker invocation against a persisted batch
    Process {
        /// Batch id
        id: u64,
    },
    /// Show the persisted state of a batch
    Status {
        /// Batch id
        id: u64,
    },
    /// Validate a batch definition file
    Validate {
        /// Path to the batch definition JSON
        definition: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

mod run;

pub use run::run;

const DEFAULT_SERVER: &str = "http://localhost:4000";


#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] crate::client::Error),

    #[error(transparent)]
    Platter(#[from] crate::error::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid option {0:?}, expected key=value")]
    InvalidOption(String),

    #[error("live stream ended")]
    StreamEnded,
}


/// Runs disk jobs one at a time per device and keeps observers in sync.
#[derive(Debug, Parser)]
#[command(name = "platter", version, about)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}


#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler and HTTP API
    Serve {
        #[arg(short, long)]
        bind: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Submit a single-step task
    Submit {
        #[arg(short, long)]
        resource: String,
        #[arg(short = 'P', long)]
        program: String,
        /// Program option as key=value, repeatable
        #[arg(short, long = "option")]
        options: Vec<String>,
        /// Append to an existing chain
        #[arg(long)]
        chain: Option<Uuid>,
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Submit a chain of tasks from a YAML file
    Chain {
        filename: PathBuf,
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// List all tasks
    Tasks {
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Show one task
    Task {
        id: Uuid,
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// List task chains
    Chains {
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Stop a task
    Stop {
        id: Uuid,
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// List resources
    Resources {
        /// Rescan before listing
        #[arg(long)]
        refresh: bool,
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Follow the live state
    Watch {
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

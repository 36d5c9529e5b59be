use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

mod run;

pub use run::run;


#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Roost(#[from] crate::Error),

    #[error(transparent)]
    Client(#[from] crate::client::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}


#[derive(Debug, Parser)]
#[command(name = "roost", about = "Compute, cache and serve dataspec artifacts")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}


#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker and its HTTP API
    Serve {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Show the last status of a task
    Status(TaskArgs),
    /// Start a task without waiting for it
    Launch(TaskArgs),
    /// Wait for a task (and its producers) to finish
    Complete(TaskArgs),
    /// Complete a task and launch the tasks depending on it
    Trigger(TaskArgs),
    /// Forget the status of a task
    Clear(TaskArgs),
    /// Print the inferred schema of an artifact
    Schema(ArtifactArgs),
    /// Print the row count of an artifact
    Size(ArtifactArgs),
    /// Print the cached rows of an artifact, one batch per line
    Rows {
        #[command(flatten)]
        artifact: ArtifactArgs,
        #[arg(long, default_value = "1024")]
        batch_size: usize,
    },
}


#[derive(Debug, Args)]
pub struct TaskArgs {
    /// Task kind: schema, size or to_cache
    pub kind: String,
    pub artifact: String,
    #[arg(short, long, default_value = "http://localhost:3000")]
    pub server: String,
}


#[derive(Debug, Args)]
pub struct ArtifactArgs {
    pub artifact: String,
    #[arg(short, long, default_value = "http://localhost:3000")]
    pub server: String,
}

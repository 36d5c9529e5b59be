pub mod artifact;
pub mod cache;
pub mod client;
pub mod command;
pub mod computation;
pub mod config;
pub mod dependency;
mod error;
pub mod server;
pub mod source;
pub mod status;
pub mod tasks;

pub use artifact::{Artifact, Batch, Record, Referrables, TaskKind, Upstream};
pub use command::{Cli, Command};
pub use computation::{Computation, Worker, WorkerComputation};
pub use config::Config;
pub use dependency::{Dependency, DependencyOrchestrator, TaskRef};
pub use error::{ComputationError, Error, StoreError};
pub use server::{serve, Server};
pub use status::{Stage, Status, StatusStore};
pub use tasks::{TaskName, TaskRegistry};

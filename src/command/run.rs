use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::artifact::{Artifact, TaskKind};
use crate::client::Client;
use crate::command::{ArtifactArgs, Cli, Command, Error, TaskArgs};
use crate::config::Config;
use crate::server::Server;


pub async fn run() -> Result<(), Error> {
    let args = Cli::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Serve { config, bind, port } => {
            serve(config, bind, port).await?;
        }
        Command::Status(task) => {
            let (client, kind, artifact) = task_target(task)?;
            print(&client.status(kind, &artifact).await?)?;
        }
        Command::Launch(task) => {
            let (client, kind, artifact) = task_target(task)?;
            print(&client.launch(kind, &artifact).await?)?;
        }
        Command::Complete(task) => {
            let (client, kind, artifact) = task_target(task)?;
            print(&client.complete(kind, &artifact).await?)?;
        }
        Command::Trigger(task) => {
            let (client, kind, artifact) = task_target(task)?;
            print(&client.trigger(kind, &artifact).await?)?;
        }
        Command::Clear(task) => {
            let (client, kind, artifact) = task_target(task)?;
            print(&client.clear(kind, &artifact).await?)?;
        }
        Command::Schema(target) => {
            let (client, artifact) = artifact_target(target)?;
            print(&client.schema(&artifact).await?)?;
        }
        Command::Size(target) => {
            let (client, artifact) = artifact_target(target)?;
            println!("{}", client.size(&artifact).await?);
        }
        Command::Rows { artifact, batch_size } => {
            let (client, artifact) = artifact_target(artifact)?;
            let mut batches = client.rows(&artifact, batch_size).await?;
            while let Some(batch) = batches.next().await {
                println!("{}", serde_json::to_string(&batch?)?);
            }
        }
    }
    Ok(())
}


fn init_logging(verbose: bool) {
    let default = if verbose { "roost=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}


async fn serve(config: Option<PathBuf>, bind: String, port: u16) -> Result<(), Error> {
    let config = match config {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    let server = Arc::new(Server::from_config(&config)?);
    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, manager = %config.manager_id, "serving");
    crate::server::serve(server, listener).await?;
    Ok(())
}


fn task_target(task: TaskArgs) -> Result<(Client, TaskKind, Artifact), Error> {
    let kind = TaskKind::parse(&task.kind)?;
    let artifact = Artifact::new(task.artifact)?;
    Ok((Client::new(task.server), kind, artifact))
}


fn artifact_target(target: ArtifactArgs) -> Result<(Client, Artifact), Error> {
    let artifact = Artifact::new(target.artifact)?;
    Ok((Client::new(target.server), artifact))
}


fn print<T: Serialize>(value: &T) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

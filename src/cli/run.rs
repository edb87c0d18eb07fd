use clap::Parser;
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::cli::{Cli, Command, Error};
use crate::client::Client;
use crate::command::Options;
use crate::config::Config;
use crate::resources::{Fleet, ResourceView};
use crate::scheduler::Scheduler;
use crate::server::Server;
use crate::sync::{apply_patch, Snapshot, StreamMessage, Synchronizer};
use crate::tasks::{SubmitTask, TaskView};


pub async fn run() -> Result<(), Error> {
    let args = Cli::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Serve { bind, port, config } => {
            serve(bind, port, config).await?;
        }
        Command::Submit { resource, program, options, chain, server } => {
            let mut task = SubmitTask::new(resource, program, parse_options(&options)?);
            task.chain = chain;
            let id = Client::new(server).submit(&task).await?;
            println!("{}", id);
        }
        Command::Chain { filename, server } => {
            let tasks: Vec<SubmitTask> = serde_yaml::from_str(&std::fs::read_to_string(filename)?)?;
            let receipt = Client::new(server).submit_chain(&tasks).await?;
            println!("chain {}", receipt.chain);
            for entry in receipt.tasks {
                println!("{:>3}  {}", entry.pos, entry.id);
            }
        }
        Command::Tasks { server } => {
            print_tasks(&Client::new(server).tasks().await?);
        }
        Command::Task { id, server } => {
            print_json(&Client::new(server).task(id).await?);
        }
        Command::Chains { server } => {
            for chain in Client::new(server).chains().await? {
                println!("chain {}", chain.chain);
                print_tasks(&chain.tasks);
            }
        }
        Command::Stop { id, server } => {
            stop(id, server).await?;
        }
        Command::Resources { refresh, server } => {
            let client = Client::new(server);
            let resources = match refresh {
                true => client.refresh_resources().await?,
                false => client.resources().await?,
            };
            print_resources(&resources);
        }
        Command::Watch { server } => {
            watch(server).await?;
        }
    }
    Ok(())
}


fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}


async fn serve(
    bind: Option<String>,
    port: Option<u16>,
    config: Option<PathBuf>
) -> Result<(), Error> {
    let mut config = Config::load(config.as_deref())?;
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let resources = match crate::discovery::scan(&config.discovery).await {
        Ok(resources) => resources,
        Err(err) => {
            error!("{}", err);
            crate::discovery::select(&config.discovery, vec![])
        }
    };
    info!(resources = ?resources, "initial resources");

    let sync = Arc::new(Synchronizer::new());
    let scheduler = Scheduler::spawn(
        Fleet::new(resources),
        config.programs.clone(),
        sync.clone()
    );

    tokio::spawn(crate::discovery::watch(config.discovery.clone(), scheduler.clone()));
    tokio::spawn(crate::inventory::watch(config.inventory.clone(), sync.clone()));

    let addr = format!("{}:{}", config.bind, config.port);
    let server = Arc::new(Server::new(scheduler, sync, config.discovery));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    crate::server::serve(server, listener).await?;
    Ok(())
}


async fn stop(id: Uuid, server: String) -> Result<(), Error> {
    let task = Client::new(server).stop(id).await?;
    println!("{} {}", task.id, task.status_label());
    Ok(())
}


async fn watch(server: String) -> Result<(), Error> {
    let mut messages = Client::new(server).watch().await?;

    let mut snapshot = match messages.next().await {
        Some(Ok(StreamMessage::Snapshot(snapshot))) => snapshot,
        Some(Ok(StreamMessage::Patch(_))) => {
            return Err(Error::Client(crate::client::Error::Stream(
                "expected a snapshot first".into()
            )));
        }
        Some(Err(err)) => return Err(err.into()),
        None => return Err(Error::StreamEnded),
    };
    print_snapshot(&snapshot);

    while let Some(message) = messages.next().await {
        match message? {
            StreamMessage::Patch(patch) => {
                if !apply_patch(&mut snapshot, &patch) {
                    warn!("patch does not apply to local snapshot");
                }
            }
            StreamMessage::Snapshot(fresh) => snapshot = fresh,
        }
        print_snapshot(&snapshot);
    }

    Err(Error::StreamEnded)
}


fn parse_options(options: &[String]) -> Result<Options, Error> {
    let mut parsed = Options::new();
    for option in options {
        let Some((key, value)) = option.split_once('=') else {
            return Err(Error::InvalidOption(option.clone()));
        };
        parsed.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(parsed)
}


fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(err) => error!("{}", err),
    }
}


fn print_snapshot(snapshot: &Value) {
    match serde_json::from_value::<Snapshot>(snapshot.clone()) {
        Ok(snapshot) => {
            println!(
                "--- {} resources, inventory {}",
                snapshot.resources.len(),
                if snapshot.external_system.available { "available" } else { "unavailable" }
            );
            print_tasks(&snapshot.tasks);
        }
        Err(err) => warn!("unreadable snapshot: {}", err),
    }
}


fn print_tasks(tasks: &[TaskView]) {
    for task in tasks {
        let eta = task.eta.map(|eta| format!("{:.0}s", eta)).unwrap_or_else(|| "-".into());
        println!(
            "{}  {:<12} {:<10} {}/{}  {:>6.2}%  eta {:<6} {:<8} {}",
            task.id,
            task.resource,
            task.program,
            task.step + 1,
            task.total_steps,
            task.progress,
            eta,
            task.status_label(),
            task.error.as_deref().unwrap_or("")
        );
    }
}


fn print_resources(resources: &[ResourceView]) {
    for resource in resources {
        let task = resource.task.map(|task| task.to_string()).unwrap_or_default();
        println!("{:<16} {:<9} {}", resource.name, resource.state, task);
    }
}

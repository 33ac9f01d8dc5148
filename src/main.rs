//! Demo worker - serves a handful of operations over stdio.
//!
//! Spawn it through `ProcessSpawner`; it is not meant to be run by hand.
//!
//! Operations:
//! - `ping(name)` → `"pong: <name>"`
//! - `echo(..)` → the arguments as an array
//! - `fail(message)` → error carrying `message`
//! - `sleep(ms)` → `ms`, after sleeping that long

use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use upm_core::observability::init_tracing;
use upm_core::port::ParentPort;
use upm_core::{Config, WorkerDispatcher};

#[derive(Parser, Debug)]
#[command(name = "upm-echo-worker")]
#[command(about = "UPM demo worker speaking the stdio link protocol")]
#[command(version)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "UPM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Service name, normally set by the host
    #[arg(long, env = "UPM_SERVICE_NAME", default_value = "echo")]
    service_name: String,
}

fn load_config(args: &Args) -> upm_core::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_json_str(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    if let Some(level) = &args.log_level {
        config.observability.log_level = level.clone();
    }
    // stdout carries the link.
    config.observability.log_to_stderr = true;
    Ok(config)
}

fn register(dispatcher: &WorkerDispatcher, service_name: String) {
    dispatcher.add_request_handler("ping", |ctx| async move {
        let name: String = ctx.arg(0)?;
        Ok(Value::String(format!("pong: {}", name)))
    });
    dispatcher.add_request_handler("echo", |ctx| async move { Ok(Value::Array(ctx.args)) });
    dispatcher.add_request_handler("fail", |ctx| async move {
        let message: String = ctx.arg(0)?;
        Err(message.into())
    });
    dispatcher.add_request_handler("sleep", |ctx| async move {
        let millis: u64 = ctx.arg(0)?;
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(Value::from(millis))
    });
    dispatcher.add_event_handler(move |ctx, data| {
        tracing::info!(service = %service_name, client_id = %ctx.client_id, event = %data, "received event");
        false
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.observability);

    let dispatcher = WorkerDispatcher::new();
    register(&dispatcher, args.service_name.clone());
    tracing::info!(service = %args.service_name, operations = ?dispatcher.operations(), "worker starting");

    dispatcher.serve(ParentPort::stdio(&config.transport)).await?;
    tracing::info!(service = %args.service_name, "host link closed, exiting");
    Ok(())
}

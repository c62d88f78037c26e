#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::too_many_lines, clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier::{
    handler_fn, Capabilities, Client, ClientOptions, CommandKind, Config, HandlerParams,
    HandlerRegistration, HandlerResult, InMemoryBroker, InvokeCommand, NoticeCommand,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// `courier` - request/reply and notices over a pub/sub broker.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Request/reply and notice middleware over a pub/sub broker.", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.courier/config.toml)
    #[arg(long = "config", global = true)]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an invoke and every notice kind against an in-memory broker
    Demo {
        /// Delay for the delayed notice, in milliseconds
        #[arg(long, default_value_t = 1_000)]
        delay_ms: u64,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Print the JSON Schema of the configuration file
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Schema = &cli.command {
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    // Respects RUST_LOG, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path).await?,
        None => Config::load_or_init().await?,
    };

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Demo { delay_ms } => run_demo(&config, Duration::from_millis(delay_ms)).await,
        Commands::Schema => Ok(()),
    }
}

async fn run_demo(config: &Config, delay: Duration) -> Result<()> {
    let broker = InMemoryBroker::with_options(config.broker_options());
    let client = Client::new(ClientOptions::from_config(config), Arc::new(broker.clone()));

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(CommandKind, String)>();
    client.register([
        HandlerRegistration::invoke(
            "demo",
            "echo",
            handler_fn(|params: HandlerParams| async move {
                Ok(HandlerResult::body(params.body).with_trace_nos(params.trace_nos))
            }),
        ),
        HandlerRegistration::new(
            "demo",
            "event",
            Capabilities::ALL_NOTICES,
            handler_fn(move |params: HandlerParams| {
                let seen_tx = seen_tx.clone();
                async move {
                    let body = String::from_utf8_lossy(&params.body).into_owned();
                    seen_tx.send((params.kind, body)).ok();
                    Ok(HandlerResult::empty())
                }
            }),
        ),
    ]);
    client.start().await?;

    let reply = client
        .invoke(
            InvokeCommand::new("demo", "echo", "hello").with_trace_no("demo-1"),
            config.default_invoke_timeout(),
        )
        .await?;
    println!(
        "invoke  -> {} (trace {:?})",
        reply.body_str().unwrap_or("<binary>"),
        reply.trace_nos
    );

    let sent = client
        .notice(NoticeCommand::new("demo", "event", "plain"), None)
        .await?;
    println!("notice  -> {}", sent.id);
    for n in 0..3 {
        let sent = client
            .notice(NoticeCommand::new("demo", "event", format!("ordered-{n}")), Some("order-42"))
            .await?;
        println!("ordered -> {}", sent.id);
    }
    let sent = client
        .delayed_notice(NoticeCommand::new("demo", "event", "delayed"), delay)
        .await?;
    println!("delayed -> {} ({} ms)", sent.id, delay.as_millis());

    let wait = delay + Duration::from_secs(5);
    for _ in 0..5 {
        let (kind, body) = tokio::time::timeout(wait, seen_rx.recv())
            .await
            .context("timed out waiting for notices")?
            .context("notice handler dropped")?;
        println!("handled {:<14} {body}", kind.as_str());
    }

    let status = client.status().await;
    info!(groups = ?status.consumer_groups, routes = status.routes, "Demo finished");
    client.shutdown().await;
    Ok(())
}

//! Pong CLI
//!
//! Publish messages to an address and follow the messages sent to one.
//!
//! ```text
//! pong subscribe orders
//! pong publish orders '{"sku": 1}'
//! ```
//!
//! Logging goes to stderr and is controlled by `PONG_LOG` (or `RUST_LOG`);
//! stdout carries only received messages and published ids.

mod output;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use pong_bus::{BusConfig, ConsulEventLog, EventBus, Message, ShutdownCode};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::output::Printer;

/// Pong: topic-routed messaging over Consul user events
#[derive(Parser, Debug)]
#[command(name = "pong")]
#[command(about = "Publish and subscribe to pong messages over Consul", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to events at address
    Subscribe {
        /// Address to follow
        address: String,

        /// Print messages without terminal colors
        #[arg(long)]
        no_color: bool,

        #[command(flatten)]
        endpoint: Endpoint,
    },

    /// Publish a message to address
    Publish {
        /// Destination address
        address: String,

        /// Message payload; parsed as JSON, sent as a string otherwise
        payload: String,

        #[command(flatten)]
        endpoint: Endpoint,
    },
}

#[derive(ClapArgs, Debug)]
struct Endpoint {
    /// Consul agent HTTP endpoint (overrides PONG_CONSUL_URI and CONSUL_HTTP_ADDR)
    #[arg(long, value_name = "URI")]
    consul: Option<String>,
}

impl Endpoint {
    fn config(&self) -> BusConfig {
        let config = BusConfig::from_env();
        match &self.consul {
            Some(uri) => config.with_consul_uri(uri),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let color = !matches!(args.command, Command::Subscribe { no_color: true, .. });
    init_logging(color);

    match args.command {
        Command::Subscribe {
            address,
            no_color,
            endpoint,
        } => subscribe(address, Printer::new(!no_color), endpoint.config()).await,
        Command::Publish {
            address,
            payload,
            endpoint,
        } => publish(address, &payload, endpoint.config()).await,
    }
}

fn init_logging(ansi: bool) {
    let filter = EnvFilter::try_from_env("PONG_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(true)
        .init();
}

async fn subscribe(address: String, printer: Printer, config: BusConfig) -> Result<()> {
    if address.is_empty() {
        bail!("argument ADDRESS required");
    }

    let bus = EventBus::new(config);
    bus.consume(address.as_str(), move |message| {
        if let Err(e) = printer.print(message) {
            warn!(error = %e, "Failed to write message");
        }
    });
    bus.on_error(|text| warn!(diagnostic = text, "Event bus reported an error"));

    let mut shutdown = bus
        .shutdown_signal()
        .context("shutdown signal already taken")?;
    bus.start().await.context("failed to start event bus")?;
    info!(address = %address, "Subscribed");

    let code = tokio::select! {
        code = &mut shutdown => code,
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("failed to listen for Ctrl-C")?;
            info!("Interrupted, stopping event bus");
            // The watch may have ended on its own in the meantime.
            if let Err(e) = bus.stop() {
                warn!(error = %e, "Stop request ignored");
            }
            shutdown.await
        }
    };

    if code == ShutdownCode::Fatal {
        bail!("fatal eventbus shutdown");
    }
    Ok(())
}

async fn publish(address: String, payload: &str, config: BusConfig) -> Result<()> {
    if address.is_empty() {
        bail!("argument ADDRESS required");
    }

    let log = ConsulEventLog::new(&config).context("failed to create Consul client")?;
    let bus = EventBus::with_log(Arc::new(log), config);

    let message = Message::new(address, parse_payload(payload));
    let id = bus.publish(&message).await.context("failed to publish message")?;
    println!("{id}");
    Ok(())
}

/// Interpret `raw` as JSON, falling back to a JSON string.
fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

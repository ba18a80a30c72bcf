//! Courier: request/response correlation over socket, HTTP, and cross-context
//! channels.
//!
//! Usage:
//!   courier serve                                   # Echo peer on port 7070
//!   courier serve --port 0 --cors                   # OS-assigned port, CORS on
//!   courier send --url ws://127.0.0.1:7070/ws --kind 1 --payload '{"x":1}'
//!   courier send --url http://127.0.0.1:7070 --health /health --kind 1
//!   courier listen --url ws://127.0.0.1:7070/ws      # Print events and states

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use courier_peer::{EchoHandler, PeerConfig, PeerServer};
use courier_protocol::{CorrelationId, Message, MessageKind};
use courier_transport::{
    ChannelBinding, RestBinding, RestConfig, SendOptions, SocketBinding, SocketConfig, Transport,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "courier", about = "Courier: request/response correlation over message channels")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file (defaults to ./courier.log if no path given)
    #[arg(long, global = true, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an echo peer until Ctrl+C
    Serve {
        /// Port to listen on (0 for OS-assigned)
        #[arg(long, default_value = "7070")]
        port: u16,

        /// Hostname to bind to
        #[arg(long, default_value = "127.0.0.1")]
        hostname: String,

        /// Maximum concurrent socket connections
        #[arg(long, default_value = "32")]
        max_connections: usize,

        /// Enable permissive CORS
        #[arg(long)]
        cors: bool,

        /// Accepted WebSocket sub-protocol
        #[arg(long)]
        protocol: Option<String>,
    },

    /// Send one request and print the reply payload
    Send {
        /// ws:// or wss:// for a socket, http:// or https:// for request-per-call
        #[arg(long)]
        url: String,

        /// Message kind
        #[arg(long)]
        kind: MessageKind,

        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,

        /// Correlation id (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Health probe path for HTTP urls, e.g. /health
        #[arg(long)]
        health: Option<String>,

        /// WebSocket sub-protocol
        #[arg(long)]
        protocol: Option<String>,

        /// Transmit without waiting for a reply
        #[arg(long)]
        fire_and_forget: bool,

        /// Give up after this many milliseconds
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,
    },

    /// Print every event and state transition until Ctrl+C
    Listen {
        /// ws:// or wss:// url
        #[arg(long)]
        url: String,

        /// WebSocket sub-protocol
        #[arg(long)]
        protocol: Option<String>,
    },
}

fn init_tracing(verbose: bool, log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(log_file_arg) = log_file {
        let log_path = if log_file_arg == "DEFAULT" {
            PathBuf::from("courier.log")
        } else {
            PathBuf::from(log_file_arg)
        };

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Command::Serve {
            port,
            hostname,
            max_connections,
            cors,
            protocol,
        } => {
            let config = PeerConfig {
                port,
                hostname,
                max_connections: Some(max_connections),
                enable_cors: cors,
                protocol,
            };
            serve(config).await
        }
        Command::Send {
            url,
            kind,
            payload,
            id,
            health,
            protocol,
            fire_and_forget,
            timeout_ms,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let message = Message {
                correlation_id: id.map(CorrelationId::from),
                kind,
                payload,
            };
            let options = SendOptions { fire_and_forget };
            let limit = Duration::from_millis(timeout_ms);

            if url.starts_with("ws://") || url.starts_with("wss://") {
                let mut config = SocketConfig::new(url);
                if let Some(protocol) = protocol {
                    config = config.with_protocol(protocol);
                }
                send_one(Transport::new("socket", SocketBinding::new(config)), message, options, limit)
                    .await
            } else if url.starts_with("http://") || url.starts_with("https://") {
                let mut config = RestConfig::new(url);
                if let Some(health) = health {
                    config = config.with_health(health);
                }
                send_one(Transport::new("rest", RestBinding::new(config)), message, options, limit)
                    .await
            } else {
                bail!("unsupported url scheme: {url}")
            }
        }
        Command::Listen { url, protocol } => {
            let mut config = SocketConfig::new(url);
            if let Some(protocol) = protocol {
                config = config.with_protocol(protocol);
            }
            listen(Transport::new("socket", SocketBinding::new(config))).await
        }
    }
}

async fn serve(config: PeerConfig) -> anyhow::Result<()> {
    let mut server = PeerServer::start(config, EchoHandler)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to start peer")?;

    println!("────────────────────────────────────────────────────────────────");
    println!();
    println!("  Echo peer running!");
    println!();
    println!("  WebSocket endpoint:");
    println!("    {}", server.ws_url());
    println!();
    println!("  HTTP endpoint:");
    println!("    {}/rpc/{{kind}}", server.http_url());
    println!();
    println!("────────────────────────────────────────────────────────────────");
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await?;

    println!();
    println!("  Shutting down...");
    server.stop().await;
    println!("  Peer stopped.");
    Ok(())
}

async fn send_one<B: ChannelBinding>(
    transport: Transport<B>,
    message: Message,
    options: SendOptions,
    limit: Duration,
) -> anyhow::Result<()> {
    transport
        .connect()
        .await
        .with_context(|| format!("{} failed to connect", transport.name()))?;

    let outcome = tokio::time::timeout(limit, transport.send_with(message, options)).await;
    transport.disconnect().await;

    match outcome {
        Ok(Ok(Some(reply))) => {
            println!("{}", serde_json::to_string_pretty(&reply.payload)?);
            Ok(())
        }
        Ok(Ok(None)) => {
            info!("Sent without awaiting a reply");
            Ok(())
        }
        Ok(Err(e)) => {
            let code = e.code();
            Err(e).context(format!("request failed ({code})"))
        }
        Err(_) => bail!("no reply within {} ms", limit.as_millis()),
    }
}

async fn listen<B: ChannelBinding>(transport: Transport<B>) -> anyhow::Result<()> {
    let mut events = transport.subscribe_events();
    let mut faults = transport.subscribe_faults();

    transport.connect().await?;
    let mut states = transport.subscribe_state();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
            fault = faults.recv() => {
                if let Ok(fault) = fault {
                    eprintln!("fault: {fault}");
                }
            }
            state = states.next() => match state {
                Some(state) => {
                    eprintln!("state: {state}");
                    if state.is_disconnected() {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    transport.disconnect().await;
    Ok(())
}

//! pvaccess - structured process-value access
//!
//! Serve in-memory records, or read and write them on a running server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pvaccess::config::{self, Config};
use pvaccess::network::{resolve_host, ClientContext, ClientPutGet, Server, ServerEvent};
use pvaccess::protocol;
use pvaccess::pvdata::{BitSet, Field, PvStructure, ScalarType, ScalarValue, Structure};

/// pvaccess - structured process-value access
#[derive(Parser)]
#[command(name = "pvaccess")]
#[command(version = "0.1.0")]
#[command(about = "Serve and access structured process values", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the configured records
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind to
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Read a channel
    Get {
        /// Channel name
        channel: String,

        /// Server host
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,
    },

    /// Write a channel's value field and read the result back
    PutGet {
        /// Channel name
        channel: String,

        /// New value, parsed as the field's type
        value: String,

        /// Field to write
        #[arg(short, long, default_value = "value")]
        field: String,

        /// Server host
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging; RUST_LOG wins over flags and config
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, bind } => {
            run_server(config, port, bind).await?;
        }
        Commands::Get {
            channel,
            server,
            port,
        } => {
            run_get(config, &server, port, &channel).await?;
        }
        Commands::PutGet {
            channel,
            value,
            field,
            server,
            port,
        } => {
            run_put_get(config, &server, port, &channel, &field, &value).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_info(&config);
        }
    }

    Ok(())
}

/// Serve the configured records until interrupted
async fn run_server(config: Config, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let mut net_config = config.network_config();
    if let Some(port) = port {
        net_config.port = port;
    }
    if let Some(bind) = bind {
        net_config.bind_address = bind;
    }

    let provider = config.build_provider()?;
    if config.records.is_empty() {
        let mut value = PvStructure::new(Structure::nt_scalar(ScalarType::Double));
        value.set("value", ScalarValue::Double(0.0))?;
        provider.add_record("demo:setpoint", value);
    }
    let names = pvaccess::provider::ChannelProvider::channel_names(&provider);
    tracing::info!("Serving {} record(s): {}", names.len(), names.join(", "));

    let mut server = Server::new(net_config, Arc::new(provider));
    let mut event_rx = server
        .take_event_receiver()
        .context("server event receiver already taken")?;

    let bind_addr = server.start().await?;
    println!("Listening on {} (Ctrl+C to stop)", bind_addr);

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { addr, priority } => {
                        tracing::info!("Client connected: {} (priority {})", addr, priority);
                    }
                    ServerEvent::ClientDisconnected { addr, forced } => {
                        if forced {
                            tracing::warn!("Client lost: {}", addr);
                        } else {
                            tracing::info!("Client disconnected: {}", addr);
                        }
                    }
                    ServerEvent::Started { bind_addr } => {
                        tracing::debug!("Server started on {}", bind_addr);
                    }
                    ServerEvent::Stopped => break,
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                server.stop().await?;
                break;
            }
        }
    }

    Ok(())
}

/// Connect a put-get operation on `channel`
async fn open_put_get(
    config: &Config,
    host: &str,
    port: u16,
    channel: &str,
) -> anyhow::Result<(pvaccess::network::ClientChannel, ClientPutGet)> {
    let addr = resolve_host(host, port).await?;
    let context = ClientContext::new(config.network_config());
    let channel = context
        .create_channel(addr, channel)
        .await
        .with_context(|| format!("cannot connect channel '{}' on {}", channel, addr))?;
    let request = PvStructure::new(Structure::builder("").build());
    let op = channel.create_put_get(&request).await?;
    Ok((channel, op))
}

async fn run_get(config: Config, host: &str, port: u16, channel: &str) -> anyhow::Result<()> {
    let (channel, mut op) = open_put_get(&config, host, port, channel).await?;
    op.set_last_request();
    let data = op.get().await?;
    println!("{}", data.value);
    channel.destroy().await?;
    Ok(())
}

async fn run_put_get(
    config: Config,
    host: &str,
    port: u16,
    channel: &str,
    field: &str,
    text: &str,
) -> anyhow::Result<()> {
    let (channel, mut op) = open_put_get(&config, host, port, channel).await?;
    let mut value = op
        .create_put()
        .context("channel has no put structure")?;

    let scalar_type = match value.structure().field_at(field) {
        Some(Field::Scalar(scalar_type)) => *scalar_type,
        Some(other) => anyhow::bail!("field '{}' is a {}, not a scalar", field, other.type_name()),
        None => anyhow::bail!("no field '{}' in {}", field, value.structure().id()),
    };
    let offset = value.set(field, ScalarValue::parse(scalar_type, text)?)?;

    op.set_last_request();
    let data = op.put_get(&value, &BitSet::from_iter([offset])).await?;
    println!("{}", data.value);
    channel.destroy().await?;
    Ok(())
}

/// Print protocol information
fn print_info(config: &Config) {
    println!("pvaccess Protocol Information");
    println!("=============================\n");

    println!("Protocol Revision: {}", protocol::PROTOCOL_REVISION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Max Payload: {} bytes", protocol::DEFAULT_MAX_PAYLOAD_SIZE);
    if let Some(path) = Config::default_path() {
        println!("Config File: {}", path.display());
    }

    let network = config.network_config();
    println!("\nConnection Timeout: {} ms", network.connection_timeout_ms);
    println!("Flush Strategy: {:?}", network.flush_strategy);
    println!("Priority: {}", network.priority);
    println!("Records: {}", config.records.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["pvaccess", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_put_get_arguments() {
        let cli = Cli::try_parse_from(["pvaccess", "put-get", "demo:setpoint", "2.5", "-s", "10.0.0.1"])
            .unwrap();
        match cli.command {
            Commands::PutGet {
                channel,
                value,
                field,
                server,
                port,
            } => {
                assert_eq!(channel, "demo:setpoint");
                assert_eq!(value, "2.5");
                assert_eq!(field, "value");
                assert_eq!(server, "10.0.0.1");
                assert_eq!(port, protocol::DEFAULT_PORT);
            }
            _ => panic!("expected put-get"),
        }
    }
}

//! Discover devices or query one device.
//!
//! ```text
//! cargo run --example kasa_query -- discover
//! cargo run --example kasa_query -- --username me@example.com --password secret \
//!     query 192.168.1.100 get_device_info
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use kasa_protocol::{Credentials, DeviceConfig, Discover, Protocol};
use serde_json::{Map, Value};
use tracing::{debug, error};

fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

/// TP-Link Kasa/Tapo protocol client
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TP-Link cloud account username
    #[arg(long, global = true, env = "KASA_USERNAME")]
    username: Option<String>,

    /// TP-Link cloud account password
    #[arg(long, global = true, env = "KASA_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover devices on the local network
    Discover {
        /// Discovery timeout in seconds
        #[arg(long, value_parser = parse_duration, default_value = "5")]
        timeout: Duration,
    },

    /// Send a request to a single device
    Query {
        /// Target hostname or IP address
        target: String,

        /// IOT request as JSON, or a SMART method name
        request: String,

        /// Try every connection type if the device does not answer discovery
        #[arg(long)]
        direct: bool,
    },
}

fn credentials(cli: &Cli) -> Option<Credentials> {
    match (&cli.username, &cli.password) {
        (Some(username), Some(password)) => Some(Credentials::new(username, password)),
        _ => None,
    }
}

fn parse_request(config: &DeviceConfig, request: &str) -> Value {
    match serde_json::from_str::<Value>(request) {
        Ok(value) => value,
        Err(_) if config.protocol_name() == "SMART" => Value::String(request.to_string()),
        Err(_) => {
            eprintln!("Error: IOT requests must be JSON");
            std::process::exit(2);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    }

    let mut discover = Discover::new();
    if let Some(credentials) = credentials(&cli) {
        discover = discover.with_credentials(credentials);
    }

    match &cli.command {
        Command::Discover { timeout } => {
            let discover = discover.with_timeout(*timeout).on_unsupported(|reply| {
                eprintln!("unsupported device at {}: {}", reply.host, reply.reason);
            });
            match discover.discover().await {
                Ok(devices) => {
                    let mut out = Map::new();
                    for (host, config) in devices {
                        out.insert(host, config.to_map().unwrap_or_default());
                    }
                    println!("{}", Value::Object(out));
                }
                Err(e) => {
                    error!("Discovery failed: {}", e);
                    eprintln!("Error: Discovery failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Command::Query {
            target,
            request,
            direct,
        } => {
            let discover = discover.with_direct_probe(*direct);
            let config = match discover.discover_single(target).await {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: Could not find device {}: {}", target, e);
                    std::process::exit(1);
                }
            };
            debug!("Connection type: {}", config.connection_type);

            let request = parse_request(&config, request);
            let protocol = match Protocol::from_config(&config) {
                Ok(protocol) => protocol,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            let outcome = protocol.query(&request).await;
            protocol.close().await;
            match outcome {
                Ok(response) => println!("{}", response),
                Err(e) => {
                    error!("Request to {} failed: {}", target, e);
                    eprintln!("Error: Request to {} failed: {}", target, e);
                    std::process::exit(1);
                }
            }
        }
    }
}

//! tictacnet - LAN sessions for two-player turn-based games
//!
//! Host a session, find sessions on the LAN and chat with the other player.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tictacnet::config::{self, Config};
use tictacnet::discovery::ServerInfo;
use tictacnet::network::{ConnectionHandle, Network, Server};
use tictacnet::protocol::{self, MessageType, Payload};

/// tictacnet - LAN sessions for two-player turn-based games
#[derive(Parser)]
#[command(name = "tictacnet")]
#[command(author = "Tictacnet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Host, discover and join two-player game sessions on the LAN", long_about = None)]
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
    /// Host a session
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Session name to announce
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Join a session and chat with the other player
    Client {
        /// Server address to connect to (host or host:port)
        #[arg(short, long)]
        server: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Join the first session found on the LAN
        #[arg(short, long)]
        discover: bool,

        /// Player name
        #[arg(short, long)]
        name: Option<String>,
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

    /// Discover sessions on the network
    Discover {
        /// How long to scan (seconds)
        #[arg(short, long, default_value_t = 3)]
        timeout: u64,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Server { port, name } => {
            run_server(config, port, name).await?;
        }
        Commands::Client {
            server,
            port,
            discover,
            name,
        } => {
            run_client(config, server, port, discover, name).await?;
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
        Commands::Discover { timeout, json } => {
            run_discovery(config, timeout, json).await?;
        }
        Commands::Info => {
            print_system_info(&config);
        }
    }

    Ok(())
}

/// Host a session until Ctrl+C
async fn run_server(config: Config, port: Option<u16>, name: Option<String>) -> anyhow::Result<()> {
    let mut server_config = config.server_config();
    if let Some(port) = port {
        server_config.port = port;
    }
    if let Some(name) = name {
        server_config.session_name = name;
    }

    let mut server = Server::new(server_config.clone());

    server.add_listener(MessageType::Hello, |message| {
        if let Payload::Hello { player_name, .. } = &message.payload {
            println!("+ {} joined as {}", player_name, message.sender);
        }
        Ok(())
    });
    server.add_listener(MessageType::Disconnect, |message| {
        if let Payload::Disconnect { reason } = &message.payload {
            println!("- {} left ({})", message.sender, reason);
        }
        Ok(())
    });
    server.add_listener(MessageType::Chat, |message| {
        if let Payload::Chat(text) = &message.payload {
            println!("[{}] {}", message.sender, text);
        }
        Ok(())
    });

    let local_addr = server.start_server().await?;

    println!("\n========================================");
    println!("  tictacnet Session Running");
    println!("========================================");
    println!("  Session: {}", server_config.session_name);
    println!("  Address: {}", local_addr);
    match server.discovery_addr() {
        Some(addr) => println!("  Discovery: {}", addr),
        None => println!("  Discovery: disabled"),
    }
    println!("========================================");
    println!("\nWaiting for players to connect...");
    println!("Press Ctrl+C to stop.\n");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    server.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Split "host:port" or "[v6]:port" when a port is given inline
///
/// A bare IPv6 address has no inline port.
fn split_server_address(address: &str, default_port: u16) -> anyhow::Result<(String, u16)> {
    if let Some(rest) = address.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            anyhow::bail!("Unterminated '[' in server address {}", address);
        };
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), port.parse()?)),
            None if tail.is_empty() => Ok((host.to_string(), default_port)),
            None => anyhow::bail!("Unexpected '{}' after ']' in server address", tail),
        };
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            Ok((host.to_string(), port.parse()?))
        }
        _ => Ok((address.to_string(), default_port)),
    }
}

/// Join a session and chat until Ctrl+C, `/quit` or the server leaves
async fn run_client(
    config: Config,
    server: Option<String>,
    port: Option<u16>,
    discover: bool,
    name: Option<String>,
) -> anyhow::Result<()> {
    let mut client_config = config.client_config();
    if let Some(name) = name {
        client_config.player_name = name;
    }
    let default_port = port.unwrap_or(client_config.port);

    let network = Network::new(client_config.clone());

    // Listeners are registered before connecting; replies go out once the
    // connection exists.
    let reply_to: Arc<OnceLock<ConnectionHandle>> = Arc::new(OnceLock::new());
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<String>();

    {
        let reply_to = reply_to.clone();
        network.add_listener(MessageType::Chat, move |message| {
            if let Payload::Chat(text) = &message.payload {
                println!("> {}", text);
                if let Some(handle) = reply_to.get() {
                    handle.try_send(Payload::Ack(text.clone()))?;
                }
            }
            Ok(())
        });
    }
    network.add_listener(MessageType::Ack, |message| {
        if let Payload::Ack(text) = &message.payload {
            tracing::debug!("Delivered: {}", text);
        }
        Ok(())
    });
    network.add_listener(MessageType::Info, |message| {
        if let Payload::Info(text) = &message.payload {
            println!("* {}", text);
        }
        Ok(())
    });
    network.add_listener(MessageType::Disconnect, move |message| {
        if let Payload::Disconnect { reason } = &message.payload {
            let _ = closed_tx.send(reason.clone());
        }
        Ok(())
    });

    let session = if let Some(address) = server {
        let (host, port) = split_server_address(&address, default_port)?;
        println!("Connecting to {}:{}...", host, port);
        network.connect(&host, port).await?
    } else if discover {
        println!("Discovering tictacnet sessions...");
        let servers = network.start_discover().await?.wait().await?;
        let Some(target) = servers.first() else {
            anyhow::bail!("No sessions found. Use --server to connect directly.");
        };
        println!(
            "Found '{}' at {}:{}",
            target.session_name, target.session_host, target.session_port
        );
        network.connect_to(target).await?
    } else {
        println!("Connecting to {}:{}...", client_config.host, default_port);
        network.connect(&client_config.host, default_port).await?
    };

    if let Some(handle) = network.sender().await {
        let _ = reply_to.set(handle);
    }

    println!("\n========================================");
    println!("  tictacnet Client Connected");
    println!("========================================");
    println!("  Player: {}", client_config.player_name);
    println!("  Session: {}", session.session_name);
    println!("  Server: {}", session.remote_addr);
    println!("  Id: {}", session.connection_id);
    println!("========================================");
    println!("\nType a message and press Enter. /quit to leave.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim() == "/quit" => break,
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        if let Err(e) = network.send_data(Payload::Chat(line)).await {
                            println!("Send failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            Some(reason) = closed_rx.recv() => {
                println!("Disconnected: {}", reason);
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    network.disconnect().await?;
    tracing::info!("Client disconnected");

    Ok(())
}

/// Run one discovery round and print what answered
async fn run_discovery(config: Config, timeout_secs: u64, json: bool) -> anyhow::Result<()> {
    let mut client_config = config.client_config();
    client_config.discovery.window_ms = Duration::from_secs(timeout_secs.max(1)).as_millis() as u64;

    let network = Network::new(client_config);

    if !json {
        println!("Scanning for tictacnet sessions ({} seconds)...\n", timeout_secs.max(1));
    }

    let servers: Vec<ServerInfo> = network.start_discover().await?.wait().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
        return Ok(());
    }

    if servers.is_empty() {
        println!("No sessions found.");
    } else {
        println!("{:<24} {:<21} {:>7}", "SESSION", "ADDRESS", "PLAYERS");
        for server in &servers {
            println!(
                "{:<24} {:<21} {:>7}",
                server.session_name,
                format!("{}:{}", server.session_host, server.session_port),
                format!("{}/{}", server.player_count, tictacnet::network::MAX_PEERS)
            );
        }
    }
    println!("\nDiscovery complete.");

    Ok(())
}

/// Print system information
fn print_system_info(config: &Config) {
    println!("tictacnet System Information");
    println!("============================\n");

    println!("Host: {}", config.general.player_name);
    println!("Platform: {}", std::env::consts::OS);
    if let Some(dir) = dirs::config_dir() {
        println!("Config: {}", dir.join("tictacnet/config.toml").display());
    }

    println!("\nProtocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Discovery Port: {}", protocol::DEFAULT_DISCOVERY_PORT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        // Test that CLI parsing works
        let cli = Cli::try_parse_from(["tictacnet", "info"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["tictacnet", "discover", "--timeout", "1", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Discover { timeout: 1, json: true }));
    }

    #[test]
    fn test_server_address_split() {
        assert_eq!(
            split_server_address("192.168.1.5:50001", 50000).unwrap(),
            ("192.168.1.5".to_string(), 50001)
        );
        assert_eq!(
            split_server_address("gamebox", 50000).unwrap(),
            ("gamebox".to_string(), 50000)
        );
        assert!(split_server_address("gamebox:notaport", 50000).is_err());
    }

    #[test]
    fn test_ipv6_server_address_split() {
        assert_eq!(
            split_server_address("2001:db8::1:2", 50000).unwrap(),
            ("2001:db8::1:2".to_string(), 50000)
        );
        assert_eq!(
            split_server_address("::1", 50000).unwrap(),
            ("::1".to_string(), 50000)
        );
        assert_eq!(
            split_server_address("[::1]:50001", 50000).unwrap(),
            ("::1".to_string(), 50001)
        );
        assert_eq!(
            split_server_address("[fe80::2]", 50000).unwrap(),
            ("fe80::2".to_string(), 50000)
        );
        assert!(split_server_address("[::1", 50000).is_err());
    }
}

//! `relay`: run a messaging server, connect to one, or print the local address.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p relay-cli -- serve` to listen on the configured endpoint,
//! and `cargo run -p relay-cli -- connect` in another terminal to talk to it.

mod settings;

use std::error::Error;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use relay_config::{CliArgs, Config};
use relay_net::{
    AddressFamily, Client, ClientEvent, ConnectionId, ConnectionState, Server, ServerEvent, local_address,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Minimal TCP messaging server and client")]
struct Cli {
    #[command(flatten)]
    options: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for clients; stdin lines are broadcast to all of them.
    ///
    /// `/to <id> <text>` sends to one client, `/kick <id>` disconnects one,
    /// `/list` prints the connected ids.
    Serve,
    /// Connect to a server; stdin lines are sent, received text is printed.
    Connect,
    /// Print this machine's local address.
    Address {
        /// Report the IPv6 address instead of IPv4.
        #[arg(long)]
        ipv6: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let config_dir = settings::config_dir(&cli.options)?;
    let mut config = Config::load_or_create(&config_dir)?;
    config.apply_cli_overrides(&cli.options);

    let log_dir = settings::log_dir(&config_dir);
    let log_file =
        relay_log::init_logging(Some(log_dir.as_path()), config.debug.log_to_file, Some(&config));
    if let Some(path) = log_file {
        info!("Writing logs to {}", path.display());
    }
    info!("Using config directory {}", config_dir.display());

    match cli.command {
        Command::Serve => serve(&config).await,
        Command::Connect => connect(&config).await,
        Command::Address { ipv6 } => {
            let family = if ipv6 { AddressFamily::V6 } else { AddressFamily::V4 };
            match local_address(family) {
                Some(ip) => println!("{ip}"),
                None => println!("not available"),
            }
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> Result<(), Box<dyn Error>> {
    let server = Arc::new(Server::new(settings::server_config(&config.network)));
    let printer = tokio::spawn(print_server_events(server.subscribe()));

    let mut runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let result = loop {
        tokio::select! {
            result = &mut runner => break result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping server");
                server.stop().await;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => server_command(&server, &line).await,
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!("stdin closed: {err}");
                    stdin_open = false;
                }
            },
        }
    };

    printer.abort();
    result?.map_err(Into::into)
}

async fn server_command(server: &Server, line: &str) {
    let line = line.trim_end();
    if line == "/list" {
        let ids: Vec<String> = server.connection_ids().iter().map(ToString::to_string).collect();
        println!("{} client(s): {}", ids.len(), ids.join(" "));
    } else if let Some(rest) = line.strip_prefix("/kick ") {
        match parse_id(rest) {
            Some(id) if server.disconnect_client(id) => println!("disconnected {id}"),
            _ => println!("no client {}", rest.trim()),
        }
    } else if let Some(rest) = line.strip_prefix("/to ") {
        let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
        match parse_id(id) {
            Some(id) if server.send_to(id, text).await => {}
            _ => println!("no client {}", id.trim()),
        }
    } else if !line.is_empty() {
        let delivered = server.broadcast(line).await;
        println!("sent to {delivered} client(s)");
    }
}

/// Accepts `7` or `#7`.
fn parse_id(text: &str) -> Option<ConnectionId> {
    let text = text.trim();
    text.strip_prefix('#').unwrap_or(text).parse().ok().map(ConnectionId)
}

async fn print_server_events(mut events: broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(ServerEvent::StatusChanged(state)) => println!("[server {state}]"),
            Ok(ServerEvent::ClientConnected { id, peer }) => println!("[{id} connected from {peer}]"),
            Ok(ServerEvent::ClientDisconnected { id }) => println!("[{id} disconnected]"),
            Ok(ServerEvent::Message { id, text }) => println!("{id}: {text}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event printer fell behind, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn connect(config: &Config) -> Result<(), Box<dyn Error>> {
    let client = Client::new(settings::client_config(&config.network));
    let printer = tokio::spawn(print_client_events(client.subscribe()));
    let mut state = client.watch_state();

    client.connect(&config.network.address, config.network.port).await?;
    if let Some(peer) = client.peer_addr() {
        info!("Connected to {peer}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = connection_lost(&mut state) => {
                println!("server closed the connection");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.is_empty() => {}
                Some(line) => client.send(&line).await?,
                None => break,
            },
        }
    }

    client.disconnect();
    printer.abort();
    Ok(())
}

async fn connection_lost(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|state| !state.is_connected()).await;
}

async fn print_client_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::StatusChanged(state)) => println!("[{state}]"),
            Ok(ClientEvent::Message(text)) => println!("{text}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event printer fell behind, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

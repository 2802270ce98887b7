use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{client::ClientConfig, server::ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, answering clock sync requests on every connection.
    Server(ServerArgs),
    /// Connect to a server, chat, and keep a synchronized clock.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:65432")]
    pub listen: SocketAddr,

    /// Longest a connection read blocks before checking for eviction.
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(1..))]
    pub idle_timeout_ms: u64,

    /// Longest a write may take before the peer is dropped.
    #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(u64).range(1..))]
    pub write_timeout_ms: u64,

    /// Malformed units tolerated per connection before it is evicted.
    #[arg(long, default_value_t = 8)]
    pub max_malformed: u32,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Alias shown to other participants.
    #[arg(long)]
    pub alias: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:65432")]
    pub server: SocketAddr,

    /// How often to synchronize with the server clock.
    #[arg(long, default_value_t = 15_000, value_parser = clap::value_parser!(u64).range(1..))]
    pub sync_interval_ms: u64,

    /// Sync exchanges with a longer round trip are discarded.
    #[arg(long, default_value_t = 5_000, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_round_trip_ms: u64,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        ServerConfig {
            listen: args.listen,
            idle_timeout: Duration::from_millis(args.idle_timeout_ms),
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            max_malformed_units: args.max_malformed,
            ..ServerConfig::default()
        }
    }
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        ClientConfig {
            server: args.server,
            alias: args.alias,
            sync_interval: Duration::from_millis(args.sync_interval_ms),
            max_round_trip: Duration::from_millis(args.max_round_trip_ms),
        }
    }
}

use anyhow::Result;
use clap::Parser;
use tracing::info;

use clock_sync_chat::{
    cli::{Cli, Command},
    client,
    server::{ChatServer, ServerConfig},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so stdout stays clean for chat output.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let server = ChatServer::bind(ServerConfig::from(args)).await?;
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            println!("server listening on {addr}");
            server.run_until_ctrl_c().await;
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

use clap::Parser;
use log::info;
use server::network::{run, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Connection lifetime in seconds
    #[clap(long, default_value = "7200")]
    connection_ttl: u64,
    /// Directory for table snapshots (in-memory only when omitted)
    #[clap(short, long)]
    data_dir: Option<PathBuf>,
    /// Deliveries per processor before a transient failure is reported
    #[clap(long, default_value = "3")]
    max_attempts: u32,
    /// Seconds between expired-connection sweeps
    #[clap(long, default_value = "60")]
    sweep_interval: u64,
    /// Bearer token required on the socket upgrade and REST calls
    #[clap(long)]
    auth_token: Option<String>,
}

/// Parses arguments, sets up logging and runs the server until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        connection_ttl: Duration::from_secs(args.connection_ttl),
        data_dir: args.data_dir,
        max_attempts: args.max_attempts,
        sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
        auth_token: args.auth_token,
    };

    info!("Starting battleship sync server on {}", config.address());
    run(config).await
}

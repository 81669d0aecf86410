use clap::Parser;
use client::game::ClientSession;
use client::guard::CreationGuard;
use client::input::spawn_stdin_reader;
use client::network::{Client, LiveTransport, NoopTransport, Transport};
use client::opponent::OpponentKind;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket endpoint of the sync server
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080/ws")]
    server: String,

    /// Wait before the single reconnect attempt, in milliseconds
    #[arg(long, default_value = "2000")]
    reconnect_delay_ms: u64,

    /// How the automated opponent picks its moves
    #[arg(short = 'o', long, value_enum, default_value = "random")]
    opponent: OpponentKind,

    /// Play locally without a server
    #[arg(long)]
    offline: bool,

    /// File holding the current game id and creation flag
    #[arg(long, default_value = "battleship-client.json")]
    state_file: PathBuf,

    /// Seed for the random opponent
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let guard = if args.offline {
        CreationGuard::in_memory()
    } else {
        CreationGuard::load(&args.state_file)
    };
    let session = ClientSession::new(guard, args.opponent.build(args.seed));

    let transport: Box<dyn Transport> = if args.offline {
        info!("Starting offline game");
        Box::new(NoopTransport)
    } else {
        info!("Connecting to: {}", args.server);
        Box::new(LiveTransport::new(args.server))
    };

    let mut client = Client::new(
        session,
        transport,
        Duration::from_millis(args.reconnect_delay_ms),
    );
    client.run(spawn_stdin_reader()).await?;

    Ok(())
}

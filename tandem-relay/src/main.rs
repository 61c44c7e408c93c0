//! Tandem relay binary.
//!
//! Runs the WebSocket relay that fans document messages out between the
//! replicas subscribed to the same topic. It keeps no document state.

use clap::Parser;
use log::info;
use tandem_collab::{RelayServer, ServerConfig};

/// Relay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "tandem-relay")]
#[command(about = "Broadcast relay for collaborative note editing")]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "TANDEM_RELAY_ADDR", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum members per document topic
    #[arg(long, default_value_t = 100)]
    max_members: usize,

    /// Messages buffered per topic before slow members lag
    #[arg(long, default_value_t = 256)]
    room_capacity: usize,

    /// Seconds between WebSocket pings
    #[arg(long, default_value_t = 30)]
    heartbeat: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG still wins when set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if args.verbose {
        "debug"
    } else {
        "info"
    }))
    .init();

    let config = ServerConfig {
        bind_addr: args.bind,
        max_members_per_room: args.max_members,
        room_capacity: args.room_capacity,
        heartbeat_interval_secs: args.heartbeat,
    };
    info!("Starting tandem-relay on {}", config.bind_addr);

    RelayServer::new(config).run().await
}

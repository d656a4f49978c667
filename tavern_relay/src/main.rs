// CLI entry point for the standalone Tavern relay.
//
// Starts a relay that brokers rooms and forwards event envelopes between
// peers. It holds no game state beyond the room directory — the current
// host peer of each room owns the accepted event log.
//
// Logging goes through env_logger; set RUST_LOG to adjust verbosity
// (default: info).

use clap::Parser;
use log::info;

use tavern_relay::server::{RelayConfig, start_relay};

/// Room relay for host-authoritative peer-to-peer game sessions.
#[derive(Parser)]
#[command(name = "relay", version, about)]
struct Args {
    /// Listen port. Port 0 lets the OS pick one.
    #[arg(long, default_value_t = 5000)]
    port: u16,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let (handle, addr) = match start_relay(RelayConfig { port: args.port }) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    info!("relay listening on {addr}");

    // The relay runs on background threads; the process exits on
    // SIGINT/SIGTERM, which tears them down. Keep the handle alive so the
    // main loop is never signalled to stop.
    let _handle = handle;
    loop {
        std::thread::park();
    }
}

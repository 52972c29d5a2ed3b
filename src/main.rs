//! Party runner
//!
//! Establishes the channels described by a JSON roster, exchanges one
//! greeting frame with every peer, logs the setup metrics, and shuts
//! down. SIGTERM/SIGINT abort an in-flight setup gracefully.

use std::path::Path;
use std::sync::Arc;

use party_comm::{CommSetup, Handshake, InsecureHandshake, PskHandshake, SetupConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --config <path>   JSON roster (required)
    // --low-latency     disable send coalescing once established

    let config_path = match parse_arg(&args, "--config") {
        Some(p) => p,
        None => {
            eprintln!("usage: party-comm --config <roster.json> [--low-latency]");
            std::process::exit(2);
        }
    };
    let low_latency = args.iter().any(|a| a == "--low-latency");

    let config = SetupConfig::load(Path::new(&config_path))?;

    log::info!("party-comm starting...");
    log::info!("  Listen:  {}", config.listen_port);
    log::info!("  Peers:   {}", config.peers.len());
    log::info!("  Timeout: {}s", config.timeout_secs);
    log::info!("  Mode:    {}", if config.lenient { "lenient" } else { "strict" });

    let handshake: Arc<dyn Handshake> = match &config.psk {
        Some(secret) => Arc::new(PskHandshake::new(secret.as_bytes())),
        None => {
            log::warn!("no pre-shared key configured, channels are unauthenticated");
            Arc::new(InsecureHandshake)
        }
    };

    let setup = CommSetup::new(config, handshake)?;

    // graceful shutdown: signals abort the setup instead of killing it
    let abort = setup.abort_flag();
    signal_hook::flag::register(signal_hook::consts::SIGTERM, abort.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, abort)?;

    let table = setup.establish()?;
    log::info!("{} channel(s) ready", table.count());

    if low_latency {
        table.set_low_latency(true);
    }

    // prove the channels carry traffic: one greeting each way per peer
    for address in table.addresses() {
        if let Some(channel) = table.get(&address) {
            channel.send(b"hello")?;
            let reply = channel.receive()?;
            log::info!(
                "greeting exchanged with {} ({} byte reply)",
                address,
                reply.len()
            );
        }
    }

    log::debug!("setup metrics:\n{}", setup.metrics().render());

    table.close_all();
    log::info!("all channels closed, exiting");
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

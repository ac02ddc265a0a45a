use anyhow::Result;
use clap::Parser;
use log::info;

use huddle::relay::{Relay, RelayConfig};

/// Development relay for huddle clients
#[derive(Parser, Debug)]
#[command(author, version, about = "huddle-relay: fans huddle envelopes out to room members.")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9400")]
    bind: String,

    /// Envelopes kept per room for clients that reconnect
    #[arg(long, default_value_t = 256)]
    history_limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let relay = Relay::bind(&RelayConfig {
        bind_addr: args.bind,
        history_limit: args.history_limit,
    })
    .await?;
    info!("huddle-relay {} on {}", env!("CARGO_PKG_VERSION"), relay.local_addr()?);

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }
    Ok(())
}

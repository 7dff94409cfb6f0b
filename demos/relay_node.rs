use std::sync::Arc;
use std::time::Duration;

use chatcast::config::RelayConfig;
use chatcast::transport::end_point::RelayEndPoint;
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    relay_address: String,

    /// idle transfers are evicted after this many seconds, 0 keeps them forever
    #[clap(long, default_value_t = 600)]
    idle_ttl_secs: u64,

    #[clap(long, default_value_t = 1024)]
    max_missing_per_control: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = RelayConfig::new(args.relay_address.parse()?);
    config.max_missing_per_control = args.max_missing_per_control;
    config.idle_transfer_ttl = match args.idle_ttl_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let end_point = RelayEndPoint::new(Arc::new(config)).await?;
    info!("relay listening on {:?}", end_point.self_addr()?);
    end_point.run().await
}

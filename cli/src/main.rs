mod watch;

use clap::Parser;
use clap::Subcommand;
use peerprobe::DiscoveryConfig;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Watch(args) => crate::watch::watch(args.into()).await?,
    };
    Ok(())
}

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover peers on the local subnets and report them until interrupted.
    Watch(WatchArgs),
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    /// TCP port to listen on and to dial on every candidate address.
    port: u16,

    /// Also dial the addresses of this host.
    #[arg(long)]
    include_self: bool,

    #[arg(long, default_value_t = 64)]
    max_concurrent_dials: usize,

    #[arg(long, default_value_t = 3000)]
    connect_timeout_ms: u64,
}

impl From<WatchArgs> for DiscoveryConfig {
    fn from(args: WatchArgs) -> Self {
        DiscoveryConfig::new(args.port)
            .skip_self(!args.include_self)
            .max_concurrent_dials(args.max_concurrent_dials)
            .connect_timeout(Duration::from_millis(args.connect_timeout_ms))
    }
}

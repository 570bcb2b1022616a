use clap::Parser;

use retunnel::config::{Cli, Command, GlobalOpts};
use retunnel::{agent, keygen, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.global);

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    match cli.command {
        Command::Keygen(args) => keygen::run(&args),
        Command::Server(args) => server::run(args, cli.global).await,
        Command::Client(args) => agent::run(args, cli.global).await,
    }
}

/// Install the global tracing subscriber.
///
/// `--quiet` suppresses all output; `--debug` raises the default level so
/// the hex-dump taps become visible. `RUST_LOG` still wins when set.
fn init_tracing(global: &GlobalOpts) {
    use tracing_subscriber::EnvFilter;

    let filter = if global.quiet {
        EnvFilter::new("off")
    } else {
        let default = if global.debug { "debug" } else { "info" };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

use anyhow::Result;
use clap::Parser;
use fleet_ledger::cli::Cli;
use tracing_subscriber::EnvFilter;

/// Log to stderr so command output on stdout stays clean.
/// FLEET_LEDGER_LOG takes the usual filter syntax, e.g. `fleet_ledger=debug`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("FLEET_LEDGER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    cli.run().await
}

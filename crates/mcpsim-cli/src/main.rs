use anyhow::Context;
use clap::Parser;
use mcpsim_cli::{Cli, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_json).context("failed to initialize logging")?;

    if mcpsim_cli::run(cli).await.is_err() {
        std::process::exit(1);
    }
    Ok(())
}

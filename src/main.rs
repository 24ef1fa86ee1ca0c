use std::sync::Arc;

use anyhow::{Context, Result};
use speech_sr::config::{load_config, CliArgs};
use speech_sr::logging::init_logging;
use speech_sr::pipeline::{conclude, Exit};
use speech_sr::runtime::{install_interrupt_handler, CancellationToken, DistInfo, Shutdown, TcpRendezvous};
use speech_sr::training::ManifestLoaderFactory;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_tolerant();
    init_logging(cli.verbose, cli.quiet, cli.json)?;

    let config = load_config(&cli).context("Failed to assemble configuration")?;
    let dist = DistInfo::from_env(config.local_rank).context("Invalid distributed launch environment")?;

    let cancel = CancellationToken::new();
    let shutdown = Arc::new(Shutdown::new());
    install_interrupt_handler(cancel.clone(), shutdown.clone())?;

    let loaders = ManifestLoaderFactory::new(&config, &dist);
    let result = speech_sr::run(&config, &dist, &TcpRendezvous, &loaders, cancel.clone(), &shutdown).await;

    match conclude(result, &cancel, &shutdown) {
        Exit::Success => Ok(()),
        Exit::Interrupted => {
            info!("Interrupted, exiting");
            std::process::exit(0);
        }
        Exit::Failed(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}

mod args;

use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};
use sail::{ConnectionState, MetaConfig, Sail, SailError};

use args::Cli;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Sail(#[from] SailError),

    #[error("Failed to render config: {0}")]
    Render(#[from] serde_json::Error),

    #[error("Failed to listen for Ctrl-C: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("sail: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let meta = MetaConfig::from_raw(cli.raw_meta()?)?;
    sail::logging::init(meta.log_level);
    info!("Starting sail v{}", env!("CARGO_PKG_VERSION"));

    let sail = Sail::builder(meta)
        .on_change(|key, _| info!("Config changed: {}", key))
        .build()?;
    sail.pull().await?;

    if cli.print {
        println!(
            "{}",
            serde_json::to_string_pretty(&sail.merge_all_namespaced())?
        );
    }

    if cli.watch {
        follow(&sail).await?;
    }

    sail.close().await?;
    Ok(())
}

/// Watches until Ctrl-C, re-arming the watch whenever the client
/// reconnects.
async fn follow(sail: &Sail) -> Result<(), CliError> {
    if let Err(e) = sail.watch().await {
        warn!("Watch not started yet: {}", e);
    }

    let mut states = sail.subscribe_state();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Received Ctrl-C, shutting down");
                return Ok(());
            }
            changed = states.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = *states.borrow_and_update();
                info!("Connection state: {}", state);
                if state == ConnectionState::Connected {
                    if let Err(e) = sail.watch().await {
                        warn!("Re-arming watch failed: {}", e);
                    }
                }
            }
        }
    }
}

mod backend;
mod cancel;
mod cli;
mod cmd;
mod config;
mod coordinator;
mod correlator;
mod credentials;
mod logger;
mod report;
mod task;

use std::process::ExitCode;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<ExitCode> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "agentcage start");

    match cli::run() {
        Ok(code) => {
            info!(?code, "agentcage finished");
            Ok(code)
        }
        Err(err) => {
            error!(error = ?err, "agentcage failed");
            Err(err)
        }
    }
}

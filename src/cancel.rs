//! Cooperative cancellation shared between the Ctrl-C handler and a run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Route Ctrl-C into this token instead of killing the process.
    ///
    /// Can only be installed once per process.
    pub fn install_ctrlc_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, cancelling run");
            token.cancel();
        })
        .context("Failed to install Ctrl-C handler")
    }
}

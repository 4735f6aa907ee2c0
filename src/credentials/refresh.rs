use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::Refresher;

/// Refreshes credentials by running a shell command that makes the Claude
/// CLI renew its own token (e.g. `claude -p ping --max-turns 1`).
pub struct CommandRefresher {
    command: String,
    timeout: Duration,
}

impl CommandRefresher {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl Refresher for CommandRefresher {
    fn refresh(&self) -> Result<()> {
        debug!(command = %self.command, timeout_secs = self.timeout.as_secs(), "refresh:start");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run refresh command: {}", self.command))?;

        let status = match child
            .wait_timeout(self.timeout)
            .context("Failed to wait for refresh command")?
        {
            Some(status) => status,
            None => {
                warn!(timeout_secs = self.timeout.as_secs(), "refresh:timed out, killing");
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "Refresh command timed out after {} seconds",
                    self.timeout.as_secs()
                );
            }
        };

        if !status.success() {
            bail!("Refresh command exited with status: {}", status);
        }
        debug!("refresh:done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_successful_command() {
        let refresher = CommandRefresher::new("true".to_string(), Duration::from_secs(5));
        assert!(refresher.refresh().is_ok());
    }

    #[test]
    fn test_failing_command() {
        let refresher = CommandRefresher::new("exit 2".to_string(), Duration::from_secs(5));
        assert!(refresher.refresh().is_err());
    }

    #[test]
    fn test_timeout_kills_command() {
        let refresher = CommandRefresher::new("sleep 10".to_string(), Duration::from_millis(100));
        let start = Instant::now();
        let err = refresher.refresh().unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

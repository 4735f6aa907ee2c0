//! Live log subscriptions backed by a long-running child process.

use std::io::{BufRead, BufReader};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, trace};

/// One line received from a log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub line: String,
    pub received_at: Instant,
}

impl LogEvent {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            received_at: Instant::now(),
        }
    }
}

type Closer = Box<dyn FnOnce() + Send>;

/// An open, append-only stream of [`LogEvent`]s.
///
/// Events buffer without bound until read. Closing is idempotent and also
/// happens on drop, so every exit path releases the underlying transport.
/// A closed subscription cannot be reopened; subscribe again instead.
pub struct LogSubscription {
    events: Receiver<LogEvent>,
    closer: Option<Closer>,
}

impl LogSubscription {
    pub fn new(events: Receiver<LogEvent>, closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            closer: Some(Box::new(closer)),
        }
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// `Disconnected` means the transport ended and no more events will come.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<LogEvent, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    /// Take an already buffered event without waiting.
    pub fn try_recv(&self) -> Result<LogEvent, TryRecvError> {
        self.events.try_recv()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closer.is_none()
    }

    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens subscriptions to a log channel shared by a group of instances.
pub trait LogTransport: Send + Sync {
    fn subscribe(&self, group: &str) -> Result<LogSubscription>;
}

/// Tails a command's stdout line by line, e.g. `fly logs -a <app>`.
///
/// The group id is appended after `args`.
pub struct CommandLogTransport {
    program: String,
    args: Vec<String>,
}

impl CommandLogTransport {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// `fly logs -a <app>`
    pub fn fly(program: impl Into<String>) -> Self {
        Self::new(program, &["logs", "-a"])
    }
}

impl LogTransport for CommandLogTransport {
    fn subscribe(&self, group: &str) -> Result<LogSubscription> {
        debug!(program = %self.program, args = ?self.args, group, "logs:subscribe");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(group)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        // Own process group: a terminal Ctrl-C must reach only us, and the
        // tail is stopped through `close`.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start log stream: {} for {}", self.program, group))?;

        let stdout = child.stdout.take().context("log stream stdout not captured")?;
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                trace!(%line, "logs:line");
                if tx.send(LogEvent::now(line)).is_err() {
                    break;
                }
            }
            trace!("logs:reader finished");
        });

        Ok(LogSubscription::new(rx, move || stop_child(child)))
    }
}

fn stop_child(mut child: Child) {
    debug!(pid = child.id(), "logs:closing subscription");
    let _ = child.kill();
    let _ = child.wait();
}

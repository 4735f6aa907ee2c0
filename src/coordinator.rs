//! One end-to-end run: resolve credentials, launch, and (for remote
//! machines) wait for the exit signal.
//!
//! ```text
//! Idle -> CredentialResolved -> Launched -> Completed ----------> Done
//!                                        \-> AwaitingCorrelation -> Done
//! ```
//!
//! Credential and launch failures end the run before anything billable
//! starts. Failures while waiting never turn into a failed run after the
//! fact: the remote workload may well have succeeded.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::{Backend, LaunchResult};
use crate::cancel::CancelToken;
use crate::correlator::{CorrelationOutcome, Correlator};
use crate::credentials::CredentialResolver;
use crate::task::TaskDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    CredentialResolved,
    Launched,
    Completed,
    AwaitingCorrelation,
    Done,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The workload finished and its exit code is known.
    Completed,
    /// No exit signal within the wait bound; the outcome is unknown.
    TimedOut,
    Cancelled,
    /// The log stream failed before an exit signal arrived.
    TransportError(String),
    /// No usable credential; nothing was launched.
    CredentialError(String),
    /// The backend could not start the workload.
    LaunchFailed(String),
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::TimedOut => "unknown (timed out)",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::TransportError(_) => "unknown (log stream lost)",
            RunOutcome::CredentialError(_) => "credential error",
            RunOutcome::LaunchFailed(_) => "launch failed",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            RunOutcome::TransportError(d)
            | RunOutcome::CredentialError(d)
            | RunOutcome::LaunchFailed(d) => Some(d),
            _ => None,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}: {}", self.label(), detail),
            None => f.write_str(self.label()),
        }
    }
}

/// Terminal record of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub backend: String,
    pub outcome: RunOutcome,
    /// `None` whenever the outcome is not `Completed`.
    pub exit_code: Option<i32>,
    /// Measured from the start of the launch call.
    pub elapsed: Duration,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Completed && self.exit_code == Some(0)
    }
}

pub struct RunCoordinator<'a> {
    resolver: &'a CredentialResolver,
    correlator: &'a Correlator,
    completion_timeout: Duration,
    cancel: CancelToken,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(
        resolver: &'a CredentialResolver,
        correlator: &'a Correlator,
        completion_timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            resolver,
            correlator,
            completion_timeout,
            cancel,
        }
    }

    /// Execute one run. Always yields exactly one result.
    pub fn run(&self, backend: &dyn Backend, task: &TaskDescriptor) -> RunResult {
        let name = backend.name();
        let mut state = RunState::Idle;
        debug!(backend = name, ?state, "run:start");

        let finish = |outcome: RunOutcome, exit_code: Option<i32>, elapsed: Duration| {
            let result = RunResult {
                backend: name.to_string(),
                outcome,
                exit_code,
                elapsed,
            };
            info!(
                backend = name,
                state = ?RunState::Done,
                outcome = %result.outcome,
                exit_code = ?result.exit_code,
                elapsed_secs = result.elapsed.as_secs_f64(),
                "run:done"
            );
            result
        };

        let credential = match self.resolver.resolve() {
            Ok(credential) => credential,
            Err(e) => {
                error!(backend = name, error = %e, "run:no usable credential");
                return finish(RunOutcome::CredentialError(e.to_string()), None, Duration::ZERO);
            }
        };
        state = RunState::CredentialResolved;
        debug!(backend = name, ?state, source = %credential.source(), "run:transition");

        let launch_started = Instant::now();
        let launch = match backend.launch(&credential, task) {
            Ok(launch) => launch,
            Err(e) => {
                error!(backend = name, error = %e, "run:launch failed");
                return finish(RunOutcome::LaunchFailed(e.detail), None, launch_started.elapsed());
            }
        };
        state = RunState::Launched;
        debug!(backend = name, ?state, "run:transition");

        match launch {
            LaunchResult::Completed {
                exit_code,
                stdout,
                stderr,
            } => {
                state = RunState::Completed;
                debug!(backend = name, ?state, exit_code, stdout_bytes = stdout.len(), "run:transition");
                if exit_code != 0 {
                    warn!(backend = name, exit_code, stderr = %stderr.trim(), "run:agent exited non-zero");
                }
                finish(RunOutcome::Completed, Some(exit_code), launch_started.elapsed())
            }
            LaunchResult::Started {
                instance_id,
                subscription,
            } => {
                state = RunState::AwaitingCorrelation;
                debug!(backend = name, ?state, %instance_id, "run:transition");

                let outcome = self.correlator.await_completion(
                    &instance_id,
                    subscription,
                    self.completion_timeout,
                    &self.cancel,
                );
                match outcome {
                    CorrelationOutcome::ExitObserved { at, exit_code } => finish(
                        RunOutcome::Completed,
                        // The launch call itself succeeded with 0.
                        Some(exit_code.unwrap_or(0)),
                        at.saturating_duration_since(launch_started),
                    ),
                    CorrelationOutcome::TimedOut => {
                        warn!(
                            backend = name,
                            %instance_id,
                            "run:outcome unknown, machine may still be running"
                        );
                        finish(RunOutcome::TimedOut, None, launch_started.elapsed())
                    }
                    CorrelationOutcome::Cancelled => {
                        finish(RunOutcome::Cancelled, None, launch_started.elapsed())
                    }
                    CorrelationOutcome::TransportError(e) => {
                        finish(RunOutcome::TransportError(e), None, launch_started.elapsed())
                    }
                }
            }
        }
    }
}

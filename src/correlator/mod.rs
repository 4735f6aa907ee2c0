//! Completion detection for workloads that outlive their launch call.
//!
//! The remote log channel is shared by every machine of an app, so a line
//! only counts as an exit signal when it both names the instance we launched
//! and carries a termination phrase. This is plain text matching against
//! `fly logs` output and will break if the platform rewords its messages.

mod subscription;

use std::sync::LazyLock;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;

pub(crate) use subscription::LogEvent;
pub use subscription::{CommandLogTransport, LogSubscription, LogTransport};

#[cfg(test)]
pub(crate) use subscription::testing;

/// Phrases the platform logs when a machine's main process is gone.
pub const TERMINATION_PHRASES: &[&str] = &["Main child exited", "machine restart policy set to 'no'"];

/// How long a dead stream waits for an interrupt that arrived with it.
const INTERRUPT_SETTLE: Duration = Duration::from_millis(50);

/// `Main child exited normally with code: 0`
static EXIT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"exited normally with code:\s*(-?\d+)").unwrap());

/// How a correlation wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// The instance's exit signal arrived at `at`. `exit_code` is set when
    /// the matching line reported one.
    ExitObserved {
        at: Instant,
        exit_code: Option<i32>,
    },
    /// Nothing matched in time. The workload may still have succeeded.
    TimedOut,
    Cancelled,
    /// The log stream ended before any exit signal.
    TransportError(String),
}

impl CorrelationOutcome {
    pub fn exit_observed(&self) -> bool {
        matches!(self, CorrelationOutcome::ExitObserved { .. })
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// True when `line` mentions `instance_id` as a whole token.
///
/// An occurrence only counts when it is not flanked by another id character
/// (ASCII alphanumeric, `-`, `_`), so `abc` does not match `runner[abcd]`
/// or `runner[abc-2]`. This is the same character set the launch output
/// parser accepts for machine ids.
pub fn references_instance(line: &str, instance_id: &str) -> bool {
    !instance_id.is_empty()
        && line.match_indices(instance_id).any(|(start, _)| {
            let before = line[..start].chars().next_back();
            let after = line[start + instance_id.len()..].chars().next();
            !before.is_some_and(is_id_char) && !after.is_some_and(is_id_char)
        })
}

/// Joint predicate: this instance AND a termination phrase, on the same line.
pub fn is_exit_signal(line: &str, instance_id: &str) -> bool {
    references_instance(line, instance_id)
        && TERMINATION_PHRASES.iter().any(|phrase| line.contains(phrase))
}

fn parse_exit_code(line: &str) -> Option<i32> {
    EXIT_CODE_RE
        .captures(line)
        .and_then(|caps| caps[1].parse().ok())
}

/// Watches a log subscription for one instance's exit signal.
#[derive(Debug, Clone)]
pub struct Correlator {
    grace: Duration,
    poll_interval: Duration,
    echo: bool,
}

impl Default for Correlator {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            echo: true,
        }
    }
}

impl Correlator {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            ..Default::default()
        }
    }

    /// Print lines that belong to the instance to stdout.
    #[cfg(test)]
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Wait until `instance_id` signals exit, `timeout` elapses, `cancel`
    /// fires, or the stream ends.
    ///
    /// The subscription is consumed and always closed before returning.
    /// After a match, trailing lines are drained for the grace period first.
    pub fn await_completion(
        &self,
        instance_id: &str,
        mut subscription: LogSubscription,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> CorrelationOutcome {
        debug!(instance_id, timeout_secs = timeout.as_secs_f64(), "correlate:start");
        let deadline = Instant::now() + timeout;

        let outcome = loop {
            if cancel.is_cancelled() {
                break CorrelationOutcome::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                break self
                    .buffered_exit(&subscription, instance_id, deadline)
                    .unwrap_or(CorrelationOutcome::TimedOut);
            }

            match subscription.recv_timeout((deadline - now).min(self.poll_interval)) {
                Ok(event) => {
                    if let Some(outcome) = self.check_event(&event, instance_id) {
                        break outcome;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // A terminal interrupt can take the tail process down a
                    // moment before the handler sets the token.
                    if interrupted_after_disconnect(cancel, deadline) {
                        break CorrelationOutcome::Cancelled;
                    }
                    break CorrelationOutcome::TransportError(
                        "log stream ended before the exit signal".to_string(),
                    );
                }
            }
        };

        if outcome.exit_observed() {
            self.drain(&subscription, instance_id);
        }
        match &outcome {
            CorrelationOutcome::TimedOut => warn!(instance_id, "correlate:timed out"),
            CorrelationOutcome::Cancelled => info!(instance_id, "correlate:cancelled"),
            CorrelationOutcome::TransportError(e) => warn!(instance_id, error = %e, "correlate:transport error"),
            CorrelationOutcome::ExitObserved { .. } => {}
        }

        subscription.close();
        outcome
    }

    fn check_event(&self, event: &LogEvent, instance_id: &str) -> Option<CorrelationOutcome> {
        self.echo_line(&event.line, instance_id);
        if !is_exit_signal(&event.line, instance_id) {
            return None;
        }
        info!(instance_id, line = %event.line, "correlate:exit signal");
        Some(CorrelationOutcome::ExitObserved {
            at: event.received_at,
            exit_code: parse_exit_code(&event.line),
        })
    }

    /// At the deadline, look through lines that were already received in
    /// time but not yet processed.
    fn buffered_exit(
        &self,
        subscription: &LogSubscription,
        instance_id: &str,
        deadline: Instant,
    ) -> Option<CorrelationOutcome> {
        while let Ok(event) = subscription.try_recv() {
            if event.received_at > deadline {
                break;
            }
            if let Some(outcome) = self.check_event(&event, instance_id) {
                return Some(outcome);
            }
        }
        None
    }

    /// Flush lines still in flight after the exit signal. Further exit
    /// signals are ignored.
    fn drain(&self, subscription: &LogSubscription, instance_id: &str) {
        let until = Instant::now() + self.grace;
        loop {
            let now = Instant::now();
            if now >= until {
                break;
            }
            match subscription.recv_timeout(until - now) {
                Ok(event) => self.echo_line(&event.line, instance_id),
                Err(_) => break,
            }
        }
    }

    fn echo_line(&self, line: &str, instance_id: &str) {
        if self.echo && references_instance(line, instance_id) {
            println!("{}", line);
        }
    }
}

fn interrupted_after_disconnect(cancel: &CancelToken, deadline: Instant) -> bool {
    let until = (Instant::now() + INTERRUPT_SETTLE).min(deadline);
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        if Instant::now() >= until {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::testing::scripted_subscription;
    use super::*;
    use std::sync::atomic::Ordering;

    fn quiet() -> Correlator {
        Correlator::new(Duration::from_millis(50)).echo(false)
    }

    #[test]
    fn test_references_instance_is_token_exact() {
        assert!(references_instance("runner[abc] started", "abc"));
        assert!(references_instance("2024-01-01T00:00:00Z app[abc] iad [info] hi", "abc"));
        assert!(!references_instance("runner[abcd] started", "abc"));
        assert!(!references_instance("runner[xabc] started", "abc"));
        assert!(!references_instance("anything", ""));
    }

    #[test]
    fn test_references_instance_with_dashes_and_underscores() {
        assert!(references_instance("app[m-1_x] iad [info] hi", "m-1_x"));
        assert!(references_instance("m-1_x: Main child exited", "m-1_x"));
        assert!(!references_instance("runner[abc-def] started", "abc"));
        assert!(!references_instance("runner[abc_2] started", "abc"));
        assert!(!references_instance("runner[x-abc] started", "abc"));
        // A later whole-token occurrence still counts.
        assert!(references_instance("abcd then [abc]", "abc"));
        assert!(is_exit_signal("app[m-1_x] machine restart policy set to 'no'", "m-1_x"));
        assert!(!is_exit_signal("app[m-1_x2] machine restart policy set to 'no'", "m-1_x"));
    }

    #[test]
    fn test_exit_signal_needs_both_conditions_on_one_line() {
        assert!(is_exit_signal("runner[abc] machine restart policy set to 'no'", "abc"));
        assert!(!is_exit_signal("runner[xyz] machine restart policy set to 'no'", "abc"));
        assert!(!is_exit_signal("runner[abc] started", "abc"));
    }

    #[test]
    fn test_parse_exit_code() {
        assert_eq!(
            parse_exit_code("app[m1] iad [info] INFO Main child exited normally with code: 3"),
            Some(3)
        );
        assert_eq!(parse_exit_code("app[m1] machine restart policy set to 'no'"), None);
    }

    #[test]
    fn test_matches_only_this_instances_exit() {
        let (subscription, closed, _tx) = scripted_subscription(&[
            "runner[abc] started",
            "runner[xyz] machine restart policy set to 'no'",
            "runner[abc] machine restart policy set to 'no'",
        ]);
        let start = Instant::now();
        let outcome =
            quiet().await_completion("abc", subscription, Duration::from_secs(5), &CancelToken::new());

        assert!(outcome.exit_observed());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_other_instance_exit_does_not_complete() {
        let (subscription, closed, _tx) = scripted_subscription(&[
            "runner[abc] started",
            "runner[xyz] machine restart policy set to 'no'",
        ]);
        let outcome = quiet().await_completion(
            "abc",
            subscription,
            Duration::from_millis(200),
            &CancelToken::new(),
        );
        assert_eq!(outcome, CorrelationOutcome::TimedOut);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_signal_on_third_line_not_second() {
        let (tx, rx) = std::sync::mpsc::channel();
        let lines = [
            "runner[abc] started",
            "runner[xyz] machine restart policy set to 'no'",
            "runner[abc] machine restart policy set to 'no'",
        ];
        let mut stamps = Vec::new();
        for line in lines {
            let event = LogEvent::now(line);
            stamps.push(event.received_at);
            tx.send(event).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        let subscription = LogSubscription::new(rx, || {});

        let outcome =
            quiet().await_completion("abc", subscription, Duration::from_secs(5), &CancelToken::new());
        assert_eq!(
            outcome,
            CorrelationOutcome::ExitObserved {
                at: stamps[2],
                exit_code: None,
            }
        );
    }

    #[test]
    fn test_signal_fires_once_and_keeps_first_match() {
        let (subscription, _closed, _tx) = scripted_subscription(&[
            "app[m1] iad [info] INFO Main child exited normally with code: 0",
            "app[m1] iad [info] machine restart policy set to 'no'",
        ]);
        let outcome =
            quiet().await_completion("m1", subscription, Duration::from_secs(5), &CancelToken::new());
        match outcome {
            CorrelationOutcome::ExitObserved { exit_code, .. } => assert_eq!(exit_code, Some(0)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_silent_stream_times_out_and_closes() {
        let (subscription, closed, _tx) = scripted_subscription(&["runner[abc] started"]);
        let start = Instant::now();
        let outcome = quiet().await_completion(
            "abc",
            subscription,
            Duration::from_millis(100),
            &CancelToken::new(),
        );

        assert_eq!(outcome, CorrelationOutcome::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancellation_is_distinct_from_timeout() {
        let (subscription, closed, _tx) = scripted_subscription(&[]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let outcome = quiet().await_completion("abc", subscription, Duration::from_secs(10), &cancel);
        handle.join().unwrap();

        assert_eq!(outcome, CorrelationOutcome::Cancelled);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stream_end_is_transport_error() {
        let (subscription, closed, tx) = scripted_subscription(&["runner[abc] started"]);
        drop(tx);
        let outcome =
            quiet().await_completion("abc", subscription, Duration::from_secs(5), &CancelToken::new());
        assert!(matches!(outcome, CorrelationOutcome::TransportError(_)));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stream_end_then_interrupt_is_cancelled() {
        let (subscription, closed, tx) = scripted_subscription(&["runner[abc] started"]);
        drop(tx);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            trigger.cancel();
        });

        let outcome = quiet().await_completion("abc", subscription, Duration::from_secs(5), &cancel);
        handle.join().unwrap();

        assert_eq!(outcome, CorrelationOutcome::Cancelled);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[cfg(unix)]
    #[test]
    fn test_interrupted_log_tail_is_cancelled() {
        // The tail prints its pid so the test can interrupt it the way a
        // terminal Ctrl-C would, right before the handler sets the token.
        let transport = CommandLogTransport::new("sh", &["-c", "echo $$; exec sleep 30"]);
        let subscription = transport.subscribe("grp").unwrap();
        let pid = subscription.recv_timeout(Duration::from_secs(5)).unwrap().line;

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            std::process::Command::new("kill")
                .args(["-INT", pid.trim()])
                .status()
                .unwrap();
            thread::sleep(Duration::from_millis(5));
            trigger.cancel();
        });

        let outcome = quiet().await_completion("abc", subscription, Duration::from_secs(10), &cancel);
        handle.join().unwrap();

        assert_eq!(outcome, CorrelationOutcome::Cancelled);
    }

    #[test]
    fn test_exit_buffered_before_deadline_still_counts() {
        let (subscription, closed, _tx) =
            scripted_subscription(&["app[m1] iad [info] INFO Main child exited normally with code: 0"]);
        let outcome = quiet().await_completion("m1", subscription, Duration::ZERO, &CancelToken::new());
        assert_eq!(
            match outcome {
                CorrelationOutcome::ExitObserved { exit_code, .. } => exit_code,
                other => panic!("unexpected outcome: {:?}", other),
            },
            Some(0)
        );
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_exit_received_after_deadline_is_ignored() {
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(LogEvent {
            line: "app[m1] machine restart policy set to 'no'".to_string(),
            received_at: Instant::now() + Duration::from_secs(60),
        })
        .unwrap();
        let subscription = LogSubscription::new(rx, || {});

        let outcome = quiet().await_completion("m1", subscription, Duration::ZERO, &CancelToken::new());
        assert_eq!(outcome, CorrelationOutcome::TimedOut);
    }

    #[test]
    fn test_match_is_reported_even_if_stream_ends_during_grace() {
        let (subscription, closed, tx) =
            scripted_subscription(&["runner[abc] machine restart policy set to 'no'"]);
        drop(tx);
        let outcome =
            quiet().await_completion("abc", subscription, Duration::from_secs(5), &CancelToken::new());
        assert!(outcome.exit_observed());
        assert!(closed.load(Ordering::SeqCst));
    }
}

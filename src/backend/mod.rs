//! Execution backends for running the agent in isolated environments.
//!
//! Each backend turns a credential and a task into external command
//! invocations. They differ in when `launch` returns:
//!
//! - [`LocalBackend`]: `docker run`/`podman run`; returns when the agent exits.
//! - [`SandboxBackend`]: reusable `docker sandbox`; returns when the agent exits.
//! - [`FlyBackend`]: `fly machine run`; returns once the machine has started,
//!   with an open log subscription to learn the outcome from.

mod fly;
mod local;
mod sandbox;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ValueEnum;
use thiserror::Error;

use crate::cmd::ProcessRunner;
use crate::config::Config;
use crate::correlator::{CommandLogTransport, LogSubscription};
use crate::credentials::Credential;
use crate::task::TaskDescriptor;

pub use fly::FlyBackend;
pub use local::LocalBackend;
pub use sandbox::{ContextState, SandboxBackend};

/// What a launch call produced.
pub enum LaunchResult {
    /// The workload ran to completion within the launch call.
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The workload is running remotely. Its outcome must be read from
    /// `subscription`, which was opened before the launch call.
    Started {
        instance_id: String,
        subscription: LogSubscription,
    },
}

impl fmt::Debug for LaunchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchResult::Completed { exit_code, .. } => f
                .debug_struct("Completed")
                .field("exit_code", exit_code)
                .finish_non_exhaustive(),
            LaunchResult::Started { instance_id, .. } => f
                .debug_struct("Started")
                .field("instance_id", instance_id)
                .finish_non_exhaustive(),
        }
    }
}

/// The workload never started.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{backend}: launch failed: {detail}")]
pub struct LaunchError {
    pub backend: String,
    pub detail: String,
}

impl LaunchError {
    pub fn new(backend: &str, detail: impl Into<String>) -> Self {
        Self {
            backend: backend.to_string(),
            detail: detail.into(),
        }
    }
}

/// Main trait for execution backends.
pub trait Backend: Send + Sync {
    /// Short name used in logs and the comparison table
    fn name(&self) -> &'static str;

    fn launch(&self, credential: &Credential, task: &TaskDescriptor) -> Result<LaunchResult, LaunchError>;
}

/// Selectable backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// docker/podman container on this machine
    Local,
    /// Persistent docker sandbox, reused across runs
    Sandbox,
    /// Ephemeral Fly.io machine
    Fly,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Local, BackendKind::Sandbox, BackendKind::Fly];
}

/// Construct a backend from config.
pub fn create_backend(
    kind: BackendKind,
    config: &Config,
    runner: Arc<dyn ProcessRunner>,
) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match kind {
        BackendKind::Local => Box::new(LocalBackend::new(
            config.runtime(),
            config.image(),
            config.workspace(),
            runner,
        )),
        BackendKind::Sandbox => Box::new(SandboxBackend::new(
            config.sandbox.binary(),
            config.sandbox.name(),
            config.workspace(),
            runner,
        )),
        BackendKind::Fly => {
            let app = config
                .fly
                .app
                .clone()
                .context("The fly backend needs `fly.app` in .agentcage.yaml")?;
            let binary = config.fly.binary();
            Box::new(
                FlyBackend::new(
                    binary,
                    app,
                    config.fly_image(),
                    runner,
                    Arc::new(CommandLogTransport::fly(binary)),
                )
                .region(config.fly.region.clone()),
            )
        }
    };
    Ok(backend)
}

/// Map a process-level failure to a launch error.
fn spawn_failure(backend: &str, err: anyhow::Error) -> LaunchError {
    LaunchError::new(backend, format!("{:#}", err))
}

/// First non-empty line of stderr, for concise error details.
fn stderr_summary(stderr: &str, status: Option<i32>) -> String {
    let line = stderr.lines().map(str::trim).find(|l| !l.is_empty());
    match (line, status) {
        (Some(line), _) => line.to_string(),
        (None, Some(code)) => format!("exited with code {}", code),
        (None, None) => "terminated by signal".to_string(),
    }
}

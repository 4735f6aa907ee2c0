//! Ephemeral Fly.io machine backend.
//!
//! `fly machine run` returns as soon as the machine boots. The agent's output
//! and exit only show up on the app's shared log channel, so the log
//! subscription is opened before launching; anything logged while the launch
//! call is in flight is buffered instead of lost.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info};

use super::{Backend, LaunchError, LaunchResult, spawn_failure, stderr_summary};
use crate::cmd::{Cmd, ProcessRunner};
use crate::correlator::LogTransport;
use crate::credentials::{Credential, OAUTH_TOKEN_ENV};
use crate::task::{AGENT_BINARY, TaskDescriptor};

/// `Machine ID: 148e21ea7e0398` in `fly machine run` output. Ids may
/// contain `-` and `_`, matching what the log correlator treats as one token.
static MACHINE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Machine ID:\s*([A-Za-z0-9][A-Za-z0-9_-]*)").unwrap());

/// Extract the launched machine's id from `fly machine run` output.
pub fn parse_machine_id(output: &str) -> Option<String> {
    MACHINE_ID_RE
        .captures(output)
        .map(|caps| caps[1].to_string())
}

pub struct FlyBackend {
    binary: String,
    app: String,
    image: String,
    region: Option<String>,
    runner: Arc<dyn ProcessRunner>,
    transport: Arc<dyn LogTransport>,
}

impl FlyBackend {
    pub fn new(
        binary: impl Into<String>,
        app: impl Into<String>,
        image: impl Into<String>,
        runner: Arc<dyn ProcessRunner>,
        transport: Arc<dyn LogTransport>,
    ) -> Self {
        Self {
            binary: binary.into(),
            app: app.into(),
            image: image.into(),
            region: None,
            runner,
            transport,
        }
    }

    pub fn region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    /// Build the `fly machine run` invocation.
    ///
    /// flyctl has no way to forward a variable by name, so the token is on
    /// the command line; it is registered as a secret to keep it out of logs.
    pub fn build_command(&self, credential: &Credential, task: &TaskDescriptor) -> Cmd {
        let env = format!("{}={}", OAUTH_TOKEN_ENV, credential.value());
        let mut cmd = Cmd::new(&self.binary)
            .args(["machine", "run", self.image.as_str()])
            .args(["--app", self.app.as_str()])
            .args(["--rm", "--restart", "no"]);
        if let Some(region) = &self.region {
            cmd = cmd.args(["--region", region.as_str()]);
        }
        cmd.args(["--env", env.as_str()])
            .arg("--")
            .arg(AGENT_BINARY)
            .args(task.agent_args())
            .secret(credential.value())
    }
}

impl Backend for FlyBackend {
    fn name(&self) -> &'static str {
        "fly"
    }

    fn launch(&self, credential: &Credential, task: &TaskDescriptor) -> Result<LaunchResult, LaunchError> {
        // Subscribe first: the machine may finish before `machine run` returns.
        let subscription = self
            .transport
            .subscribe(&self.app)
            .map_err(|e| LaunchError::new(self.name(), format!("could not open log stream: {:#}", e)))?;

        let cmd = self.build_command(credential, task);
        info!(app = %self.app, image = %self.image, region = ?self.region, "fly:launch");
        debug!(command = %cmd.display(), "fly:command");

        // On any error below, dropping `subscription` closes it.
        let output = self
            .runner
            .run(&cmd)
            .map_err(|e| spawn_failure(self.name(), e))?;
        if !output.success() {
            return Err(LaunchError::new(
                self.name(),
                stderr_summary(&output.stderr, output.status),
            ));
        }

        let instance_id = parse_machine_id(&output.stdout)
            .or_else(|| parse_machine_id(&output.stderr))
            .ok_or_else(|| LaunchError::new(self.name(), "no machine id in `fly machine run` output"))?;
        info!(app = %self.app, %instance_id, "fly:machine started");

        Ok(LaunchResult::Started {
            instance_id,
            subscription,
        })
    }
}

//! Persistent `docker sandbox` backend.
//!
//! One named sandbox is created on first use and reused by every later run.
//! The sandbox's environment is fixed at creation, so fresh credentials are
//! written into it as files on each run instead of passed as env vars.
//! Concurrent runs against the same sandbox name are not supported.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use super::{Backend, LaunchError, LaunchResult, spawn_failure, stderr_summary};
use crate::cmd::{Cmd, ProcessRunner};
use crate::credentials::Credential;
use crate::task::{AGENT_BINARY, TaskDescriptor};

/// Shell snippet run inside the sandbox to store the credentials blob.
const WRITE_CREDENTIALS: &str =
    r#"mkdir -p "$HOME/.claude" && cat > "$HOME/.claude/.credentials.json" && chmod 600 "$HOME/.claude/.credentials.json""#;

/// Shell snippet run inside the sandbox to store the onboarding marker.
const WRITE_ONBOARDING: &str = r#"cat > "$HOME/.claude.json""#;

/// Marks first-run onboarding as done so the CLI does not prompt.
const ONBOARDING_MARKER: &str = r#"{"hasCompletedOnboarding":true}"#;

/// Whether `ensure_context` had to create the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Reused,
}

pub struct SandboxBackend {
    binary: String,
    context: String,
    workspace: PathBuf,
    runner: Arc<dyn ProcessRunner>,
}

impl SandboxBackend {
    pub fn new(
        binary: impl Into<String>,
        context: impl Into<String>,
        workspace: PathBuf,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            binary: binary.into(),
            context: context.into(),
            workspace,
            runner,
        }
    }

    pub fn context_name(&self) -> &str {
        &self.context
    }

    fn sandbox_cmd(&self) -> Cmd {
        Cmd::new(&self.binary).arg("sandbox")
    }

    /// Create the sandbox if it does not exist yet.
    ///
    /// Safe to call repeatedly: an existing sandbox is left alone, and a
    /// create that races with another and reports "already exists" counts as
    /// reuse.
    pub fn ensure_context(&self) -> Result<ContextState, LaunchError> {
        let inspect = self.sandbox_cmd().args(["inspect", self.context.as_str()]);
        let output = self
            .runner
            .run(&inspect)
            .map_err(|e| spawn_failure(self.name(), e))?;
        if output.success() {
            debug!(context = %self.context, "sandbox:reusing existing context");
            return Ok(ContextState::Reused);
        }

        info!(context = %self.context, workspace = %self.workspace.display(), "sandbox:creating context");
        let create = self
            .sandbox_cmd()
            .args(["create", "--name", self.context.as_str(), AGENT_BINARY])
            .arg(self.workspace.to_string_lossy().into_owned());
        let output = self
            .runner
            .run(&create)
            .map_err(|e| spawn_failure(self.name(), e))?;

        if output.success() {
            Ok(ContextState::Created)
        } else if output.stderr.contains("already exists") {
            debug!(context = %self.context, "sandbox:created concurrently, reusing");
            Ok(ContextState::Reused)
        } else {
            Err(LaunchError::new(
                self.name(),
                format!(
                    "could not create sandbox '{}': {}",
                    self.context,
                    stderr_summary(&output.stderr, output.status)
                ),
            ))
        }
    }

    /// Write the credentials blob and the onboarding marker into the sandbox.
    ///
    /// Both writes overwrite, so repeating them is harmless.
    pub fn inject_credential(&self, credential: &Credential) -> Result<(), LaunchError> {
        let blob = credential.to_blob();
        self.write_file(WRITE_CREDENTIALS, blob.into_bytes(), "credentials")
            .and_then(|()| self.write_file(WRITE_ONBOARDING, ONBOARDING_MARKER, "onboarding marker"))
    }

    fn write_file(&self, script: &str, contents: impl Into<Vec<u8>>, what: &str) -> Result<(), LaunchError> {
        let cmd = self
            .sandbox_cmd()
            .args(["exec", "-i", self.context.as_str(), "sh", "-c", script])
            .stdin(contents);
        let output = self
            .runner
            .run(&cmd)
            .map_err(|e| spawn_failure(self.name(), e))?;
        if !output.success() {
            return Err(LaunchError::new(
                self.name(),
                format!(
                    "could not write {} into sandbox '{}': {}",
                    what,
                    self.context,
                    stderr_summary(&output.stderr, output.status)
                ),
            ));
        }
        debug!(context = %self.context, what, "sandbox:injected");
        Ok(())
    }

    pub fn build_command(&self, task: &TaskDescriptor) -> Cmd {
        self.sandbox_cmd()
            .args(["exec", self.context.as_str(), AGENT_BINARY])
            .args(task.agent_args())
            .streaming()
    }
}

impl Backend for SandboxBackend {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn launch(&self, credential: &Credential, task: &TaskDescriptor) -> Result<LaunchResult, LaunchError> {
        let state = self.ensure_context()?;
        info!(context = %self.context, ?state, "sandbox:context ready");
        self.inject_credential(credential)?;

        let cmd = self.build_command(task);
        debug!(command = %cmd.display(), "sandbox:command");
        let output = self
            .runner
            .run(&cmd)
            .map_err(|e| spawn_failure(self.name(), e))?;

        Ok(LaunchResult::Completed {
            exit_code: output.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::testing::{ScriptedRunner, failed_output, ok_output};
    use crate::credentials::CredentialResolver;
    use crate::task::OutputFormat;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Emulates `docker sandbox` with a single context that exists once created.
    fn stateful_runner(exists: bool) -> Arc<ScriptedRunner> {
        let created = Arc::new(AtomicBool::new(exists));
        Arc::new(ScriptedRunner::new(move |cmd| {
            let args = cmd.get_args();
            match args.get(1).map(String::as_str) {
                Some("inspect") if created.load(Ordering::SeqCst) => Ok(ok_output("{}")),
                Some("inspect") => Ok(failed_output(1, "Error: no such sandbox: agentcage")),
                Some("create") => {
                    created.store(true, Ordering::SeqCst);
                    Ok(ok_output("agentcage\n"))
                }
                _ => Ok(ok_output("")),
            }
        }))
    }

    fn backend(runner: Arc<ScriptedRunner>) -> SandboxBackend {
        SandboxBackend::new("docker", "agentcage", PathBuf::from("/home/me/project"), runner)
    }

    fn subcommands(runner: &ScriptedRunner) -> Vec<String> {
        runner
            .calls()
            .iter()
            .map(|c| c.get_args()[1].clone())
            .collect()
    }

    #[test]
    fn test_ensure_context_twice_creates_once() {
        let runner = stateful_runner(false);
        let sandbox = backend(runner.clone());

        assert_eq!(sandbox.ensure_context().unwrap(), ContextState::Created);
        assert_eq!(sandbox.ensure_context().unwrap(), ContextState::Reused);
        assert_eq!(subcommands(&runner), ["inspect", "create", "inspect"]);

        let create = &runner.calls()[1];
        assert_eq!(
            create.display(),
            "docker sandbox create --name agentcage claude /home/me/project"
        );
    }

    #[test]
    fn test_ensure_context_tolerates_concurrent_create() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| match cmd.get_args()[1].as_str() {
            "inspect" => Ok(failed_output(1, "no such sandbox")),
            _ => Ok(failed_output(1, "Error: sandbox agentcage already exists")),
        }));
        assert_eq!(backend(runner).ensure_context().unwrap(), ContextState::Reused);
    }

    #[test]
    fn test_ensure_context_create_failure() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| match cmd.get_args()[1].as_str() {
            "inspect" => Ok(failed_output(1, "no such sandbox")),
            _ => Ok(failed_output(1, "docker: 'sandbox' is not a docker command.")),
        }));
        let err = backend(runner).ensure_context().unwrap_err();
        assert_eq!(err.backend, "sandbox");
        assert!(err.detail.contains("not a docker command"));
    }

    #[test]
    fn test_inject_pipes_blob_through_stdin() {
        let runner = stateful_runner(true);
        let credential = CredentialResolver::new(Some("tok".to_string()), vec![])
            .resolve()
            .unwrap();
        backend(runner.clone()).inject_credential(&credential).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);

        let creds = &calls[0];
        assert_eq!(&creds.get_args()[..4], ["sandbox", "exec", "-i", "agentcage"]);
        assert!(creds.get_args()[6].contains(".claude/.credentials.json"));
        let blob: serde_json::Value = serde_json::from_slice(creds.get_stdin().unwrap()).unwrap();
        assert_eq!(blob["claudeAiOauth"]["accessToken"], "tok");
        // The secret travels only through stdin.
        assert!(!creds.display().contains("tok"));

        let onboarding = &calls[1];
        assert_eq!(onboarding.get_stdin().unwrap(), ONBOARDING_MARKER.as_bytes());
    }

    #[test]
    fn test_launch_reuses_context_then_runs_agent() {
        let runner = stateful_runner(true);
        let credential = CredentialResolver::new(Some("tok".to_string()), vec![])
            .resolve()
            .unwrap();
        let task = TaskDescriptor::new("hello", 1, OutputFormat::Text).unwrap();

        let result = backend(runner.clone()).launch(&credential, &task).unwrap();
        assert!(matches!(result, LaunchResult::Completed { exit_code: 0, .. }));
        assert_eq!(subcommands(&runner), ["inspect", "exec", "exec", "exec"]);

        let run = runner.calls().pop().unwrap();
        assert!(run.is_streaming());
        assert!(run.display().starts_with("docker sandbox exec agentcage claude -p hello"));
        assert!(run.get_stdin().is_none());
    }

    #[test]
    fn test_failed_injection_stops_before_launch() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| match cmd.get_args()[1].as_str() {
            "inspect" => Ok(ok_output("{}")),
            _ => Ok(failed_output(1, "sandbox is not running")),
        }));
        let credential = CredentialResolver::new(Some("tok".to_string()), vec![])
            .resolve()
            .unwrap();
        let task = TaskDescriptor::new("hello", 1, OutputFormat::Text).unwrap();

        let err = backend(runner.clone()).launch(&credential, &task).unwrap_err();
        assert!(err.detail.contains("credentials"));
        assert_eq!(runner.call_count(), 2);
    }
}

//! Docker/Podman container backend.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use super::{Backend, LaunchError, LaunchResult, spawn_failure, stderr_summary};
use crate::cmd::{Cmd, ProcessRunner};
use crate::config::ContainerRuntime;
use crate::credentials::{Credential, OAUTH_TOKEN_ENV};
use crate::task::{AGENT_BINARY, TaskDescriptor};

/// Mount point of the workspace inside the container.
const CONTAINER_WORKDIR: &str = "/workspace";

/// `docker run` exit codes that come from the runtime itself rather than
/// the containerized process: 125 daemon error, 126 cannot invoke, 127 not
/// found.
const RUNTIME_FAILURE_CODES: std::ops::RangeInclusive<i32> = 125..=127;

pub struct LocalBackend {
    runtime: ContainerRuntime,
    image: String,
    workspace: PathBuf,
    runner: Arc<dyn ProcessRunner>,
}

impl LocalBackend {
    pub fn new(
        runtime: ContainerRuntime,
        image: impl Into<String>,
        workspace: PathBuf,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            runtime,
            image: image.into(),
            workspace,
            runner,
        }
    }

    /// Build the `run` invocation.
    ///
    /// The token is forwarded by name (`-e VAR`) from the child environment
    /// so it never lands on the command line.
    pub fn build_command(&self, credential: &Credential, task: &TaskDescriptor) -> Cmd {
        let mount = format!("{}:{}", self.workspace.display(), CONTAINER_WORKDIR);
        Cmd::new(self.runtime.binary())
            .args(["run", "--rm", "-i"])
            .args(["-v", mount.as_str()])
            .args(["-w", CONTAINER_WORKDIR])
            .args(["-e", OAUTH_TOKEN_ENV])
            .arg(&self.image)
            .arg(AGENT_BINARY)
            .args(task.agent_args())
            .env(OAUTH_TOKEN_ENV, credential.value())
            .workdir(&self.workspace)
            .streaming()
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn launch(&self, credential: &Credential, task: &TaskDescriptor) -> Result<LaunchResult, LaunchError> {
        let cmd = self.build_command(credential, task);
        info!(runtime = self.runtime.binary(), image = %self.image, "local:launch");
        debug!(command = %cmd.display(), "local:command");

        let output = self
            .runner
            .run(&cmd)
            .map_err(|e| spawn_failure(self.name(), e))?;

        if let Some(code) = output.status
            && RUNTIME_FAILURE_CODES.contains(&code)
            && output.stdout.trim().is_empty()
        {
            return Err(LaunchError::new(
                self.name(),
                stderr_summary(&output.stderr, output.status),
            ));
        }

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
    use crate::cmd::testing::{ScriptedRunner, failed_output};
    use crate::cmd::ProcessOutput;
    use crate::credentials::CredentialResolver;
    use crate::task::OutputFormat;

    fn credential() -> Credential {
        CredentialResolver::new(Some("tok".to_string()), vec![])
            .resolve()
            .unwrap()
    }

    fn task() -> TaskDescriptor {
        TaskDescriptor::new("list files", 2, OutputFormat::Text).unwrap()
    }

    fn backend(runtime: ContainerRuntime, runner: Arc<ScriptedRunner>) -> LocalBackend {
        LocalBackend::new(runtime, "agent:latest", PathBuf::from("/tmp/ws"), runner)
    }

    #[test]
    fn test_command_shape() {
        let runner = Arc::new(ScriptedRunner::succeeding(""));
        let cmd = backend(ContainerRuntime::Docker, runner).build_command(&credential(), &task());

        assert_eq!(cmd.program(), "docker");
        assert_eq!(
            cmd.display(),
            "docker run --rm -i -v /tmp/ws:/workspace -w /workspace -e CLAUDE_CODE_OAUTH_TOKEN \
             agent:latest claude -p list files --max-turns 2 --output-format text \
             --dangerously-skip-permissions"
        );
        assert_eq!(cmd.get_env(OAUTH_TOKEN_ENV), Some("tok"));
        assert!(!cmd.get_args().iter().any(|a| a.contains("tok")));
        assert!(cmd.is_streaming());
    }

    #[test]
    fn test_podman_runtime() {
        let runner = Arc::new(ScriptedRunner::succeeding(""));
        let cmd = backend(ContainerRuntime::Podman, runner).build_command(&credential(), &task());
        assert_eq!(cmd.program(), "podman");
    }

    #[test]
    fn test_nonzero_workload_exit_is_completed() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(ProcessOutput {
                status: Some(1),
                stdout: "partial work\n".to_string(),
                stderr: "agent gave up".to_string(),
            })
        }));
        let result = backend(ContainerRuntime::Docker, runner)
            .launch(&credential(), &task())
            .unwrap();
        match result {
            LaunchResult::Completed { exit_code, stdout, .. } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stdout, "partial work\n");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_runtime_error_is_launch_failure() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(failed_output(
                125,
                "Unable to find image 'agent:latest' locally\nerror pulling image",
            ))
        }));
        let err = backend(ContainerRuntime::Docker, runner)
            .launch(&credential(), &task())
            .unwrap_err();
        assert_eq!(err.backend, "local");
        assert!(err.detail.contains("Unable to find image"));
    }

    #[test]
    fn test_missing_binary_is_launch_failure() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            anyhow::bail!("Failed to execute command: docker run")
        }));
        let err = backend(ContainerRuntime::Docker, runner)
            .launch(&credential(), &task())
            .unwrap_err();
        assert!(err.detail.contains("Failed to execute command"));
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::task::OutputFormat;

const PROJECT_CONFIG_NAMES: [&str; 2] = [".agentcage.yaml", ".agentcage.yml"];

/// Container runtime for the local backend
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    /// Docker (default)
    #[default]
    Docker,
    /// Podman
    Podman,
}

impl ContainerRuntime {
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

/// Settings for the persistent `docker sandbox` context
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct SandboxConfig {
    /// Name of the reusable sandbox. Default: "agentcage"
    #[serde(default)]
    pub name: Option<String>,

    /// Docker CLI providing the `sandbox` plugin. Default: "docker"
    #[serde(default)]
    pub binary: Option<String>,
}

impl SandboxConfig {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("agentcage")
    }

    pub fn binary(&self) -> &str {
        self.binary.as_deref().unwrap_or("docker")
    }
}

/// Settings for ephemeral Fly.io machines
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct FlyConfig {
    /// Fly app that owns the machines and the shared log channel (required)
    #[serde(default)]
    pub app: Option<String>,

    /// Image to boot. Defaults to the top-level `image`
    #[serde(default)]
    pub image: Option<String>,

    /// Region to launch in. Fly picks one if unset
    #[serde(default)]
    pub region: Option<String>,

    /// flyctl binary. Default: "fly"
    #[serde(default)]
    pub binary: Option<String>,
}

impl FlyConfig {
    pub fn binary(&self) -> &str {
        self.binary.as_deref().unwrap_or("fly")
    }
}

/// Where credentials are looked up and how they are refreshed
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct CredentialsConfig {
    /// Explicit OAuth token. `CLAUDE_CODE_OAUTH_TOKEN` takes precedence
    #[serde(default)]
    pub oauth_token: Option<String>,

    /// Keychain service name. Default: "Claude Code-credentials"
    #[serde(default)]
    pub keychain_service: Option<String>,

    /// Credentials file. Default: ~/.claude/.credentials.json
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shell command that renews the stored token
    #[serde(default)]
    pub refresh_command: Option<String>,

    /// Refresh when the token expires within this many seconds. Default: 300
    #[serde(default)]
    pub refresh_threshold_secs: Option<u64>,

    /// Upper bound for the refresh command. Default: 30
    #[serde(default)]
    pub refresh_timeout_secs: Option<u64>,
}

impl CredentialsConfig {
    pub fn keychain_service(&self) -> &str {
        self.keychain_service
            .as_deref()
            .unwrap_or("Claude Code-credentials")
    }

    pub fn credentials_file(&self) -> Option<PathBuf> {
        self.file
            .clone()
            .or_else(|| home::home_dir().map(|h| h.join(".claude").join(".credentials.json")))
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs.unwrap_or(300))
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs.unwrap_or(30))
    }

    fn merge(self, project: Self) -> Self {
        Self {
            oauth_token: project.oauth_token.or(self.oauth_token),
            keychain_service: project.keychain_service.or(self.keychain_service),
            file: project.file.or(self.file),
            refresh_command: project.refresh_command.or(self.refresh_command),
            refresh_threshold_secs: project.refresh_threshold_secs.or(self.refresh_threshold_secs),
            refresh_timeout_secs: project.refresh_timeout_secs.or(self.refresh_timeout_secs),
        }
    }
}

/// Configuration for agentcage, read from .agentcage.yaml
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Container runtime for the local backend. Default: docker
    #[serde(default)]
    pub runtime: Option<ContainerRuntime>,

    /// Agent image for the local and fly backends. Default: "agentcage-agent"
    #[serde(default)]
    pub image: Option<String>,

    /// Directory mounted as the agent's workspace. Default: current directory
    #[serde(default)]
    pub workspace: Option<PathBuf>,

    /// Prompt used when none is given on the command line
    #[serde(default)]
    pub default_prompt: Option<String>,

    /// Agent turn limit. Default: 10
    #[serde(default)]
    pub max_turns: Option<u32>,

    /// Agent output format. Default: text
    #[serde(default)]
    pub output_format: Option<OutputFormat>,

    /// Upper bound on waiting for a remote machine to finish. Default: 300
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Time to keep reading logs after the exit signal. Default: 2
    #[serde(default)]
    pub grace_secs: Option<u64>,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub fly: FlyConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl Config {
    /// Load and merge global and project configurations.
    pub fn load() -> anyhow::Result<Self> {
        debug!("config:loading");
        let global_config = Self::load_global()?.unwrap_or_default();
        let start_dir = std::env::current_dir().unwrap_or_default();
        let project_config = match find_project_config(&start_dir) {
            Some(path) => Self::load_from_path(&path)?.unwrap_or_default(),
            None => Config::default(),
        };
        Ok(global_config.merge(project_config))
    }

    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    /// Load the global configuration file from the XDG config directory.
    fn load_global() -> anyhow::Result<Option<Self>> {
        if let Some(home_dir) = home::home_dir() {
            for name in ["config.yaml", "config.yml"] {
                let path = home_dir.join(".config/agentcage").join(name);
                if path.exists() {
                    return Self::load_from_path(&path);
                }
            }
        }
        Ok(None)
    }

    /// Merge a project config into a global config. Project config takes precedence.
    fn merge(self, project: Self) -> Self {
        /// Macro to merge Option fields where project overrides global.
        macro_rules! merge_options {
            ($global:expr, $project:expr, $($field:ident),+ $(,)?) => {
                Self {
                    $($field: $project.$field.or($global.$field),)+
                    ..Default::default()
                }
            };
        }

        let mut merged = merge_options!(
            self,
            project,
            runtime,
            image,
            workspace,
            default_prompt,
            max_turns,
            output_format,
            timeout_secs,
            grace_secs,
        );

        merged.sandbox = SandboxConfig {
            name: project.sandbox.name.or(self.sandbox.name),
            binary: project.sandbox.binary.or(self.sandbox.binary),
        };
        merged.fly = FlyConfig {
            app: project.fly.app.or(self.fly.app),
            image: project.fly.image.or(self.fly.image),
            region: project.fly.region.or(self.fly.region),
            binary: project.fly.binary.or(self.fly.binary),
        };
        merged.credentials = self.credentials.merge(project.credentials);
        merged
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime.unwrap_or_default()
    }

    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or("agentcage-agent")
    }

    pub fn fly_image(&self) -> &str {
        self.fly.image.as_deref().unwrap_or_else(|| self.image())
    }

    /// Workspace directory, falling back to the current directory.
    pub fn workspace(&self) -> PathBuf {
        self.workspace
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns.unwrap_or(10)
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output_format.unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(300))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs.unwrap_or(2))
    }

    pub fn credentials(&self) -> &CredentialsConfig {
        &self.credentials
    }
}

/// Find the nearest project config walking upward from `start_dir`.
pub fn find_project_config(start_dir: &Path) -> Option<PathBuf> {
    let dir = start_dir
        .canonicalize()
        .unwrap_or_else(|_| start_dir.to_path_buf());

    for ancestor in dir.ancestors() {
        for name in PROJECT_CONFIG_NAMES {
            let candidate = ancestor.join(name);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "config:found project config");
                return Some(candidate);
            }
        }
    }
    None
}

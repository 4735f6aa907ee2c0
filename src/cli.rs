use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use tracing::{info, warn};

use crate::backend::{BackendKind, ContextState, SandboxBackend, create_backend};
use crate::cancel::CancelToken;
use crate::cmd::{ProcessRunner, SystemRunner};
use crate::config::Config;
use crate::coordinator::{RunCoordinator, RunOutcome, RunResult};
use crate::correlator::Correlator;
use crate::credentials::CredentialResolver;
use crate::report;
use crate::task::{OutputFormat, TaskDescriptor};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "agentcage")]
#[command(about = "Run a headless coding agent in a local container, a docker sandbox, or a Fly.io machine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct TaskArgs {
    /// Prompt for the agent (falls back to `default_prompt` in config)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Maximum agent turns
    #[arg(long)]
    max_turns: Option<u32>,

    /// Agent output format
    #[arg(long, value_enum)]
    output_format: Option<OutputFormat>,

    /// Seconds to wait for a remote machine to finish
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent once on a single backend
    Run {
        #[arg(value_enum)]
        backend: BackendKind,

        #[command(flatten)]
        task: TaskArgs,
    },

    /// Run the same task on several backends in turn and compare outcomes
    Compare {
        /// Backends to run, in order
        #[arg(long, value_enum, value_delimiter = ',', default_values_t = BackendKind::ALL)]
        backends: Vec<BackendKind>,

        #[command(flatten)]
        task: TaskArgs,
    },

    /// Show which credential would be used and how long it stays valid
    Auth,

    /// Manage the persistent docker sandbox
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum SandboxCommands {
    /// Create the sandbox if it does not exist yet
    Ensure,
}

/// Shared pieces every run needs.
struct Session {
    config: Config,
    runner: Arc<dyn ProcessRunner>,
    resolver: CredentialResolver,
    correlator: Correlator,
    cancel: CancelToken,
}

impl Session {
    fn new() -> Result<Self> {
        let config = Config::load()?;
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner);
        let resolver = CredentialResolver::from_config(&config, runner.clone());
        let correlator = Correlator::new(config.grace());
        let cancel = CancelToken::new();
        cancel.install_ctrlc_handler()?;
        Ok(Self {
            config,
            runner,
            resolver,
            correlator,
            cancel,
        })
    }

    fn task(&self, args: &TaskArgs) -> Result<TaskDescriptor> {
        let prompt = args
            .prompt
            .clone()
            .or_else(|| self.config.default_prompt.clone())
            .context("No prompt given. Pass --prompt or set `default_prompt` in .agentcage.yaml")?;
        TaskDescriptor::new(
            prompt,
            args.max_turns.unwrap_or_else(|| self.config.max_turns()),
            args.output_format.unwrap_or_else(|| self.config.output_format()),
        )
    }

    fn timeout(&self, args: &TaskArgs) -> Duration {
        args.timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.timeout())
    }

    fn run_one(&self, kind: BackendKind, task: &TaskDescriptor, timeout: Duration) -> Result<RunResult> {
        let backend = create_backend(kind, &self.config, self.runner.clone())?;
        let coordinator = RunCoordinator::new(&self.resolver, &self.correlator, timeout, self.cancel.clone());
        Ok(coordinator.run(backend.as_ref(), task))
    }
}

fn exit_code_for(results: &[RunResult]) -> ExitCode {
    if !results.is_empty() && results.iter().all(RunResult::succeeded) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Placeholder result for a backend that was never attempted.
fn not_run(kind: BackendKind, outcome: RunOutcome) -> RunResult {
    let backend = match kind {
        BackendKind::Local => "local",
        BackendKind::Sandbox => "sandbox",
        BackendKind::Fly => "fly",
    };
    RunResult {
        backend: backend.to_string(),
        outcome,
        exit_code: None,
        elapsed: Duration::ZERO,
    }
}

// --- Public Entry Point ---
pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { backend, task } => {
            let session = Session::new()?;
            let descriptor = session.task(&task)?;
            let result = session.run_one(backend, &descriptor, session.timeout(&task))?;
            report::print(std::slice::from_ref(&result));
            Ok(exit_code_for(&[result]))
        }
        Commands::Compare { backends, task } => {
            let session = Session::new()?;
            let descriptor = session.task(&task)?;
            let timeout = session.timeout(&task);

            let mut results = Vec::with_capacity(backends.len());
            for kind in backends {
                if session.cancel.is_cancelled() {
                    results.push(not_run(kind, RunOutcome::Cancelled));
                    continue;
                }
                info!(backend = ?kind, "compare:next backend");
                let result = match session.run_one(kind, &descriptor, timeout) {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(backend = ?kind, error = %e, "compare:backend not configured");
                        not_run(kind, RunOutcome::LaunchFailed(format!("{:#}", e)))
                    }
                };
                results.push(result);
            }

            println!();
            report::print(&results);
            Ok(exit_code_for(&results))
        }
        Commands::Auth => {
            let config = Config::load()?;
            let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner);
            let credential = CredentialResolver::from_config(&config, runner).resolve()?;

            println!("{} {}", style("source:").bold(), credential.source());
            if let Some(plan) = credential.subscription_type() {
                println!("{} {}", style("plan:").bold(), plan);
            }
            let validity = match credential.remaining(SystemTime::now()) {
                Some(left) => format!("valid for {}", report::format_elapsed(left)),
                None => "does not expire".to_string(),
            };
            println!("{} {}", style("status:").bold(), style(validity).green());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sandbox {
            command: SandboxCommands::Ensure,
        } => {
            let config = Config::load()?;
            let sandbox = SandboxBackend::new(
                config.sandbox.binary(),
                config.sandbox.name(),
                config.workspace(),
                Arc::new(SystemRunner),
            );
            let state = sandbox.ensure_context()?;
            let verb = match state {
                ContextState::Created => "Created",
                ContextState::Reused => "Reusing",
            };
            println!("✓ {} sandbox {}", verb, style(sandbox.context_name()).bold());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

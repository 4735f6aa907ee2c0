//! The unit of work handed to the agent.

use std::fmt;

use anyhow::{Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Output format passed to `claude --output-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    StreamJson,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::StreamJson => "stream-json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    prompt: String,
    max_turns: u32,
    output_format: OutputFormat,
}

impl TaskDescriptor {
    pub fn new(prompt: impl Into<String>, max_turns: u32, output_format: OutputFormat) -> Result<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            bail!("Task prompt must not be empty");
        }
        if max_turns == 0 {
            bail!("max_turns must be at least 1");
        }
        Ok(Self {
            prompt,
            max_turns,
            output_format,
        })
    }

    /// Arguments for the agent binary, excluding the binary itself.
    pub fn agent_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.prompt.clone(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
            "--output-format".to_string(),
            self.output_format.as_str().to_string(),
            // Headless runs cannot answer permission prompts.
            "--dangerously-skip-permissions".to_string(),
        ]
    }
}

/// The agent executable launched inside every environment.
pub const AGENT_BINARY: &str = "claude";

//! Backing stores for the Claude OAuth credentials blob.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CredentialSource, SecretStore};
use crate::cmd::{Cmd, ProcessRunner};

/// The OAuth entry the Claude CLI persists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthEntry {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
}

impl OAuthEntry {
    pub fn expires_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.expires_at)
    }
}

/// Stores write `{"claudeAiOauth": {...}}`; hand-written files sometimes
/// carry the inner object alone.
#[derive(Deserialize)]
#[serde(untagged)]
enum CredentialsDocument {
    Wrapped {
        #[serde(rename = "claudeAiOauth")]
        claude_ai_oauth: OAuthEntry,
    },
    Bare(OAuthEntry),
}

/// A parsed entry together with the document it came from.
#[derive(Debug, Clone)]
pub struct StoredSecret {
    pub entry: OAuthEntry,
    /// Original document, forwarded verbatim when injecting into a sandbox.
    pub raw: String,
}

impl StoredSecret {
    pub fn parse(raw: &str) -> Result<Self> {
        let document: CredentialsDocument =
            serde_json::from_str(raw).context("Credentials are not a valid OAuth document")?;
        let entry = match document {
            CredentialsDocument::Wrapped { claude_ai_oauth } => claude_ai_oauth,
            CredentialsDocument::Bare(entry) => entry,
        };
        Ok(Self {
            entry,
            raw: raw.trim().to_string(),
        })
    }

    #[cfg(test)]
    pub fn from_entry(entry: OAuthEntry) -> Self {
        let raw = serde_json::json!({ "claudeAiOauth": &entry }).to_string();
        Self { entry, raw }
    }
}

/// The JSON credentials file, `~/.claude/.credentials.json` by default.
pub struct FileStore {
    path: PathBuf,
    label: String,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        let label = path.display().to_string();
        Self { path, label }
    }
}

impl SecretStore for FileStore {
    fn source(&self) -> CredentialSource {
        CredentialSource::FileStore
    }

    fn name(&self) -> &str {
        &self.label
    }

    fn read(&self) -> Result<Option<StoredSecret>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        StoredSecret::parse(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
            .map(Some)
    }
}

/// The macOS login keychain, read through `security`.
pub struct KeychainStore {
    service: String,
    runner: Arc<dyn ProcessRunner>,
}

impl KeychainStore {
    pub fn new(service: impl Into<String>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            service: service.into(),
            runner,
        }
    }
}

impl SecretStore for KeychainStore {
    fn source(&self) -> CredentialSource {
        CredentialSource::SecretStore
    }

    fn name(&self) -> &str {
        "keychain"
    }

    fn read(&self) -> Result<Option<StoredSecret>> {
        let cmd = Cmd::new("security").args(["find-generic-password", "-s", self.service.as_str(), "-w"]);
        let output = self.runner.run(&cmd)?;
        if !output.success() {
            // Exit 44: item not found
            debug!(service = %self.service, status = ?output.status, "keychain:no entry");
            return Ok(None);
        }
        let raw = output.stdout.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        StoredSecret::parse(raw)
            .with_context(|| format!("Keychain entry '{}' is malformed", self.service))
            .map(Some)
    }
}

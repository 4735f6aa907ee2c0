//! OAuth credential resolution.
//!
//! Credentials are looked up fresh on every run, in a fixed priority order:
//!
//! 1. An explicit override token (`CLAUDE_CODE_OAUTH_TOKEN` or config).
//!    Externally managed; never refreshed and never expires from our view.
//! 2. The OS keychain entry written by the Claude CLI (macOS only).
//! 3. The `~/.claude/.credentials.json` file.
//!
//! An expired secret is reported as [`CredentialError::Expired`] rather than
//! being skipped, since the fix (refresh) differs from the fix for a missing
//! one (log in).

mod refresh;
mod store;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cmd::ProcessRunner;
use crate::config::Config;

pub use refresh::CommandRefresher;
pub use store::{FileStore, KeychainStore, StoredSecret};

#[cfg(test)]
pub use store::OAuthEntry;

/// Environment variable consulted for the override token, and the variable
/// the agent reads its token from.
pub const OAUTH_TOKEN_ENV: &str = "CLAUDE_CODE_OAUTH_TOKEN";

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    EnvOverride,
    SecretStore,
    FileStore,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CredentialSource::EnvOverride => "override",
            CredentialSource::SecretStore => "keychain",
            CredentialSource::FileStore => "credentials file",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("No Claude credentials found. Run `claude` and log in, or set {OAUTH_TOKEN_ENV}.")]
    NotFound,

    #[error("Claude credentials from the {origin} expired at {} (epoch ms). Run `claude` to refresh them.", expiry_millis(.expired_at))]
    Expired {
        origin: CredentialSource,
        expired_at: SystemTime,
    },
}

/// A bearer token ready to hand to a backend.
#[derive(Clone)]
pub struct Credential {
    value: String,
    expires_at: Option<SystemTime>,
    source: CredentialSource,
    subscription_type: Option<String>,
    blob: Option<String>,
}

impl Credential {
    fn from_override(token: &str) -> Self {
        Self {
            value: token.trim().to_string(),
            expires_at: None,
            source: CredentialSource::EnvOverride,
            subscription_type: None,
            blob: None,
        }
    }

    fn from_stored(secret: StoredSecret, source: CredentialSource) -> Self {
        Self {
            expires_at: Some(secret.entry.expires_at()),
            value: secret.entry.access_token,
            source,
            subscription_type: secret.entry.subscription_type,
            blob: Some(secret.raw),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// `None` for override tokens, whose lifetime is managed elsewhere.
    #[cfg(test)]
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn subscription_type(&self) -> Option<&str> {
        self.subscription_type.as_deref()
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        !self.value.is_empty() && self.expires_at.is_none_or(|at| at > now)
    }

    /// Time left before expiry, `None` when the credential never expires here.
    pub fn remaining(&self, now: SystemTime) -> Option<Duration> {
        self.expires_at
            .map(|at| at.duration_since(now).unwrap_or(Duration::ZERO))
    }

    fn expires_within(&self, threshold: Duration, now: SystemTime) -> bool {
        self.remaining(now).is_some_and(|left| left <= threshold)
    }

    /// The credentials-file document to write into a remote context.
    ///
    /// Store-sourced credentials reuse the exact blob they were read from.
    /// Override tokens get a synthesized document.
    pub fn to_blob(&self) -> String {
        if let Some(blob) = &self.blob {
            return blob.clone();
        }
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| SystemTime::now() + OVERRIDE_BLOB_VALIDITY);
        serde_json::json!({
            "claudeAiOauth": {
                "accessToken": self.value,
                "expiresAt": epoch_millis(expires_at),
                "subscriptionType": self.subscription_type,
            }
        })
        .to_string()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"***")
            .field("expires_at", &self.expires_at.map(epoch_millis))
            .field("source", &self.source)
            .field("subscription_type", &self.subscription_type)
            .finish()
    }
}

/// Expiry written into synthesized blobs for override tokens. The remote CLI
/// rejects documents without `expiresAt`.
const OVERRIDE_BLOB_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn expiry_millis(at: &SystemTime) -> u64 {
    epoch_millis(*at)
}

pub(crate) fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A backing store that may hold a credentials blob.
pub trait SecretStore: Send + Sync {
    fn source(&self) -> CredentialSource;

    /// Short label for logs.
    fn name(&self) -> &str;

    /// `Ok(None)` when the store simply has nothing for us.
    fn read(&self) -> Result<Option<StoredSecret>>;
}

/// Renews the stored credential out of band.
///
/// Implementations write the renewed secret to the stores themselves; the
/// resolver only re-reads them.
pub trait Refresher: Send + Sync {
    fn refresh(&self) -> Result<()>;
}

/// Outcome of one pass over the backing stores.
#[derive(Default)]
struct Scan {
    valid: Option<Credential>,
    expired: Option<(CredentialSource, SystemTime)>,
}

impl Scan {
    fn into_result(self) -> Result<Credential, CredentialError> {
        match (self.valid, self.expired) {
            (Some(credential), _) => Ok(credential),
            (None, Some((origin, expired_at))) => Err(CredentialError::Expired { origin, expired_at }),
            (None, None) => Err(CredentialError::NotFound),
        }
    }
}

pub struct CredentialResolver {
    override_token: Option<String>,
    stores: Vec<Box<dyn SecretStore>>,
    refresher: Option<Box<dyn Refresher>>,
    refresh_threshold: Duration,
}

impl CredentialResolver {
    pub fn new(override_token: Option<String>, stores: Vec<Box<dyn SecretStore>>) -> Self {
        Self {
            override_token,
            stores,
            refresher: None,
            refresh_threshold: Duration::ZERO,
        }
    }

    /// Refresh once when the best candidate is expired or expires within
    /// `threshold`.
    pub fn with_refresher(mut self, refresher: Box<dyn Refresher>, threshold: Duration) -> Self {
        self.refresher = Some(refresher);
        self.refresh_threshold = threshold;
        self
    }

    /// Build the resolver for the host: env/config override, keychain on
    /// macOS, then the credentials file.
    pub fn from_config(config: &Config, runner: Arc<dyn ProcessRunner>) -> Self {
        let creds = config.credentials();
        let override_token = std::env::var(OAUTH_TOKEN_ENV)
            .ok()
            .or_else(|| creds.oauth_token.clone());

        let mut stores: Vec<Box<dyn SecretStore>> = Vec::new();
        if cfg!(target_os = "macos") {
            stores.push(Box::new(KeychainStore::new(creds.keychain_service(), runner)));
        }
        if let Some(path) = creds.credentials_file() {
            stores.push(Box::new(FileStore::new(path)));
        }

        let resolver = Self::new(override_token, stores);
        match &creds.refresh_command {
            Some(command) => resolver.with_refresher(
                Box::new(CommandRefresher::new(command.clone(), creds.refresh_timeout())),
                creds.refresh_threshold(),
            ),
            None => resolver,
        }
    }

    pub fn resolve(&self) -> Result<Credential, CredentialError> {
        self.resolve_at(SystemTime::now())
    }

    pub fn resolve_at(&self, now: SystemTime) -> Result<Credential, CredentialError> {
        if let Some(token) = self
            .override_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        {
            debug!("credentials:using override token");
            return Ok(Credential::from_override(token));
        }

        let scan = self.scan(now);
        let Some(refresher) = &self.refresher else {
            return scan.into_result();
        };

        let needs_refresh = match &scan.valid {
            Some(credential) => credential.expires_within(self.refresh_threshold, now),
            None => scan.expired.is_some(),
        };
        if !needs_refresh {
            return scan.into_result();
        }

        info!("credentials:refreshing stale credential");
        if let Err(e) = refresher.refresh() {
            warn!(error = %e, "credentials:refresh failed");
            return scan.into_result();
        }

        let rescan = self.scan(now);
        if rescan.valid.is_some() {
            return rescan.into_result();
        }
        scan.into_result()
    }

    fn scan(&self, now: SystemTime) -> Scan {
        let mut scan = Scan::default();
        for store in &self.stores {
            let secret = match store.read() {
                Ok(Some(secret)) => secret,
                Ok(None) => {
                    debug!(store = store.name(), "credentials:store empty");
                    continue;
                }
                Err(e) => {
                    warn!(store = store.name(), error = %e, "credentials:store unreadable");
                    continue;
                }
            };
            if secret.entry.access_token.trim().is_empty() {
                debug!(store = store.name(), "credentials:store has blank token");
                continue;
            }

            let credential = Credential::from_stored(secret, store.source());
            if credential.is_valid_at(now) {
                debug!(store = store.name(), "credentials:found valid token");
                scan.valid = Some(credential);
                return scan;
            }

            debug!(store = store.name(), "credentials:token expired");
            if scan.expired.is_none()
                && let Some(at) = credential.expires_at
            {
                scan.expired = Some((credential.source, at));
            }
        }
        scan
    }
}

//! API credential resolution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::Venue;

/// Reference to a stored credential: whose keys, on which venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef {
    pub user_id: String,
    pub venue: Venue,
}

impl CredentialRef {
    pub fn new(user_id: impl Into<String>, venue: Venue) -> Self {
        Self {
            user_id: user_id.into(),
            venue,
        }
    }
}

/// API credentials for one account.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masked = match self.api_key.chars().count() {
            0..=4 => "****".to_string(),
            _ => format!("{}****", self.api_key.chars().take(4).collect::<String>()),
        };
        f.debug_struct("Credentials")
            .field("api_key", &masked)
            .field("active", &self.active)
            .finish()
    }
}

/// Resolves the active API credentials for `(user, venue)`.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, reference: &CredentialRef) -> anyhow::Result<Option<Credentials>>;
}

/// Fixed credential table, for tests and paper trading.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialProvider {
    entries: HashMap<CredentialRef, Credentials>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: CredentialRef, credentials: Credentials) -> Self {
        self.entries.insert(reference, credentials);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn resolve(&self, reference: &CredentialRef) -> anyhow::Result<Option<Credentials>> {
        Ok(self
            .entries
            .get(reference)
            .filter(|c| c.active)
            .cloned())
    }
}

/// Reads `{VENUE}_API_KEY` / `{VENUE}_API_SECRET` from the environment.
///
/// Single-user: every `user_id` resolves to the same process credentials.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialProvider;

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn resolve(&self, reference: &CredentialRef) -> anyhow::Result<Option<Credentials>> {
        let prefix = format!("{:?}", reference.venue).to_ascii_uppercase();
        let key = std::env::var(format!("{prefix}_API_KEY")).unwrap_or_default();
        let secret = std::env::var(format!("{prefix}_API_SECRET")).unwrap_or_default();
        if key.is_empty() || secret.is_empty() {
            return Ok(None);
        }
        Ok(Some(Credentials {
            api_key: key,
            api_secret: secret,
            passphrase: std::env::var(format!("{prefix}_API_PASSPHRASE")).ok(),
            active: true,
        }))
    }
}

//! Static token store.
//!
//! Tokens are provisioned outside the server (config file, installer) and
//! loaded once at startup. A cold start with no tokens configured generates a
//! single full-access token and writes it back so the server is always usable.

use super::permissions::{PermissionSet, ALL};
use chrono::{DateTime, Utc};
use mcp_core::{generate_token, McpResult};
use std::collections::{BTreeMap, HashMap};
use tracing::{error, info, warn};

/// Where tokens come from and where bootstrap tokens are saved.
pub trait TokenSource {
    /// token → comma-separated permission list
    fn load(&self) -> McpResult<BTreeMap<String, String>>;

    /// Record a newly generated token.
    fn persist(&self, token: &str, permissions: &str) -> McpResult<()>;
}

/// One provisioned token.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub permissions: PermissionSet,
    pub issued_at: DateTime<Utc>,
}

/// Immutable token → permissions mapping.
#[derive(Debug, Default)]
pub struct AuthStore {
    tokens: HashMap<String, AuthToken>,
}

impl AuthStore {
    /// Load tokens from `source`, bootstrapping one if none are configured.
    pub fn load(source: &dyn TokenSource) -> McpResult<Self> {
        let configured = source.load()?;

        if configured.is_empty() {
            let token = generate_token();
            match source.persist(&token, ALL) {
                Ok(()) => warn!(token = %token, "no auth tokens configured, created default token"),
                Err(e) => error!(
                    token = %token,
                    error = %e,
                    "created default token but could not save it; it is valid until restart"
                ),
            }
            return Ok(Self::from_tokens([(token, ALL.to_string())]));
        }

        let store = Self::from_tokens(configured);
        info!(count = store.len(), "loaded auth tokens");
        Ok(store)
    }

    /// Build a store from `(token, permission list)` pairs.
    pub fn from_tokens<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let issued_at = Utc::now();
        let tokens = entries
            .into_iter()
            .map(|(token, perms)| {
                let token = token.into();
                let entry = AuthToken {
                    token: token.clone(),
                    permissions: PermissionSet::parse(perms.as_ref()),
                    issued_at,
                };
                (token, entry)
            })
            .collect();
        Self { tokens }
    }

    /// Whether `token` is provisioned.
    pub fn is_valid(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    /// Permission labels of `token`. Advisory only.
    pub fn permissions(&self, token: &str) -> Option<&PermissionSet> {
        self.tokens.get(token).map(|t| &t.permissions)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &AuthToken> {
        self.tokens.values()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

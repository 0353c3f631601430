use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};
use forge_core::{CryptoService, StoreClient};
use forge_git::{parse_repo_url, Provider};
use redis::AsyncCommands;

/// Resolves access tokens for clone/push/PR operations.
///
/// Priority chain: the inline token on the task (handled by the caller),
/// then a registered key looked up by name, then a provider-scoped
/// environment variable. Registry writes happen elsewhere; this is the read
/// side only.
pub struct KeyResolver {
    store: StoreClient,
    crypto: Arc<CryptoService>,
    provider_domains: BTreeMap<String, String>,
}

impl KeyResolver {
    pub fn new(
        store: StoreClient,
        crypto: Arc<CryptoService>,
        provider_domains: BTreeMap<String, String>,
    ) -> Self {
        Self {
            store,
            crypto,
            provider_domains,
        }
    }

    /// Resolves a token for the repository, trying the named registry entry
    /// first and falling back to the provider's environment variable.
    pub async fn resolve_token(&self, repo_url: &str, provider_key: &str) -> Result<String> {
        let repo = parse_repo_url(repo_url, &self.provider_domains)?;

        if !provider_key.is_empty() {
            if let Some(token) = self.registry_token(provider_key, repo.provider).await {
                return Ok(token);
            }
        }

        if let Some(token) = env_token(repo.provider) {
            return Ok(token);
        }

        bail!(
            "no access token available for {} (provide access_token, provider_key, or set {}_TOKEN)",
            repo_url,
            repo.provider.as_str().to_ascii_uppercase()
        );
    }

    async fn registry_token(&self, name: &str, provider: Provider) -> Option<String> {
        let key = self.store.key(&["keys", name]);
        let mut conn = self.store.connection();
        let fields: HashMap<String, String> = conn.hgetall(&key).await.ok()?;
        if fields.is_empty() {
            return None;
        }
        // A key registered for a different provider does not apply.
        if let Some(registered) = fields.get("provider") {
            if !registered.is_empty() && registered != provider.as_str() {
                return None;
            }
        }
        let encrypted = fields.get("encrypted_token")?;
        match self.crypto.decrypt(encrypted) {
            Ok(token) if !token.is_empty() => Some(token),
            Ok(_) => None,
            Err(error) => {
                tracing::error!(key = name, %error, "failed to decrypt registered key");
                None
            }
        }
    }
}

fn env_token(provider: Provider) -> Option<String> {
    let variable = match provider {
        Provider::GitHub => "GITHUB_TOKEN",
        Provider::GitLab => "GITLAB_TOKEN",
        Provider::Unknown => return None,
    };
    std::env::var(variable)
        .ok()
        .filter(|token| !token.is_empty())
}

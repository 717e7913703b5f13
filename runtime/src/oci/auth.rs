//! Per-registry credential selection.
//!
//! A [`CredentialSelector`] maps registry hostnames (exact match) to a
//! [`CredentialStrategy`]. Hosts without a strategy are pulled anonymously.
//! The registry client asks for a credential on every request it cannot
//! serve from its own token cache.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ocifs_core::error::{Result, RootfsError};
use serde::Deserialize;

use super::credentials::CredentialStore;
use super::reference::canonical_registry;

/// Docker Hub token service.
const DOCKER_HUB_REALM: &str = "https://auth.docker.io/token";
const DOCKER_HUB_SERVICE: &str = "registry.docker.io";

/// Environment variables holding the GitHub container registry secret.
pub const GHCR_USERNAME_ENV: &str = "GHCR_USERNAME";
pub const GHCR_TOKEN_ENV: &str = "GH_PAT";

/// Credential presented to a registry.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => write!(f, "Anonymous"),
            Credential::Basic { username, .. } => {
                write!(f, "Basic {{ username: {:?}, password: <redacted> }}", username)
            }
            Credential::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

/// Source of credentials, keyed by registry host.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credential for pulling `repository` from `registry`.
    async fn credential(&self, registry: &str, repository: &str) -> Result<Credential>;
}

/// How credentials are obtained for one registry.
#[derive(Debug, Clone)]
pub enum CredentialStrategy {
    /// Exchange for a pull-scoped anonymous token at `realm`.
    AnonymousToken { realm: String, service: String },
    /// Fixed credential, e.g. from the environment or the credential store.
    Static(Credential),
}

/// Host-keyed credential registry.
pub struct CredentialSelector {
    strategies: HashMap<String, CredentialStrategy>,
    http: reqwest::Client,
}

impl CredentialSelector {
    /// Selector without any strategy: every registry is anonymous.
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            strategies: HashMap::new(),
            http,
        }
    }

    /// Selector with the built-in public registry strategy (Docker Hub).
    pub fn with_defaults() -> Self {
        Self::new().with_strategy(
            "docker.io",
            CredentialStrategy::AnonymousToken {
                realm: DOCKER_HUB_REALM.to_string(),
                service: DOCKER_HUB_SERVICE.to_string(),
            },
        )
    }

    /// Defaults plus secrets taken from the process environment.
    pub fn from_env() -> Self {
        Self::with_defaults().with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Register the GitHub container registry credential when both
    /// username and token are available from `lookup`.
    pub fn with_env_lookup(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let username = lookup(GHCR_USERNAME_ENV).filter(|v| !v.is_empty());
        let token = lookup(GHCR_TOKEN_ENV).filter(|v| !v.is_empty());
        match (username, token) {
            (Some(username), Some(token)) => self.with_strategy(
                "ghcr.io",
                CredentialStrategy::Static(Credential::basic(username, token)),
            ),
            (None, Some(_)) => {
                tracing::debug!(
                    "{} is set but {} is not; ghcr.io stays anonymous",
                    GHCR_TOKEN_ENV,
                    GHCR_USERNAME_ENV
                );
                self
            }
            _ => self,
        }
    }

    /// Register every saved login. A saved login replaces a built-in
    /// strategy for the same host.
    pub fn with_credential_store(self, store: &CredentialStore) -> Result<Self> {
        Ok(store
            .strategies()?
            .into_iter()
            .fold(self, |selector, (host, strategy)| {
                selector.with_strategy(&host, strategy)
            }))
    }

    pub fn with_strategy(mut self, registry: &str, strategy: CredentialStrategy) -> Self {
        self.strategies.insert(canonical_registry(registry), strategy);
        self
    }

    pub fn strategy(&self, registry: &str) -> Option<&CredentialStrategy> {
        self.strategies.get(&canonical_registry(registry))
    }

    /// Resolve the credential for `registry` (exact host match).
    pub async fn select(&self, registry: &str, repository: &str) -> Result<Credential> {
        match self.strategy(registry) {
            Some(CredentialStrategy::AnonymousToken { realm, service }) => {
                let scope = pull_scope(repository);
                let token =
                    fetch_token(&self.http, registry, realm, Some(service), &scope, None).await?;
                tracing::debug!(registry, repository, "Obtained anonymous pull token");
                Ok(Credential::Bearer(token))
            }
            Some(CredentialStrategy::Static(credential)) => Ok(credential.clone()),
            None => Ok(Credential::Anonymous),
        }
    }
}

impl Default for CredentialSelector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl CredentialProvider for CredentialSelector {
    async fn credential(&self, registry: &str, repository: &str) -> Result<Credential> {
        self.select(registry, repository).await
    }
}

/// Scope string granting pull access to `repository`.
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Exchange (optionally basic) credentials for a bearer token at `realm`.
pub(crate) async fn fetch_token(
    http: &reqwest::Client,
    registry: &str,
    realm: &str,
    service: Option<&str>,
    scope: &str,
    basic: Option<(&str, &str)>,
) -> Result<String> {
    let auth_err = |message: String| RootfsError::AuthToken {
        registry: registry.to_string(),
        message,
    };

    let mut query: Vec<(&str, &str)> = vec![("scope", scope)];
    if let Some(service) = service {
        query.push(("service", service));
    }
    let mut request = http.get(realm).query(&query);
    if let Some((username, password)) = basic {
        request = request.basic_auth(username, Some(password));
    }

    let response = request
        .send()
        .await
        .map_err(|e| auth_err(format!("token request to {} failed: {}", realm, e)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(auth_err(format!("token endpoint {} returned {}", realm, status)));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| auth_err(format!("failed to decode token response: {}", e)))?;
    body.token
        .or(body.access_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| auth_err("token response has no token".to_string()))
}

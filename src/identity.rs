//! Identity gate: turns a presented credential into a verified identity.
//!
//! The coordinator never inspects credentials itself. It consumes the
//! [`Identity`] produced here plus the privilege flag derived by
//! [`PrivilegeClassifier`].

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{env_flag, env_list};
use crate::types::Identity;

/// Errors that can occur while verifying a credential
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("No credential supplied")]
    Missing,

    #[error("Credential rejected: {0}")]
    Rejected(String),

    #[error("Credential could not be decoded: {0}")]
    Malformed(String),

    #[error("Identity provider unreachable: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Trait implemented by every credential verifier
#[async_trait]
pub trait IdentityGate: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError>;
}

/// Identity gate configuration
#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    /// Remote verification endpoint (bearer token in, identity JSON out)
    pub verify_url: Option<String>,
    /// Accept unsigned base64url JSON identities. Development only.
    pub dev_tokens: bool,
    /// Emails always classified as host
    pub host_emails: Vec<String>,
    /// Domains whose non-numeric accounts are classified as host
    pub host_domains: Vec<String>,
}

impl IdentityConfig {
    /// Load identity config from environment variables
    pub fn from_env() -> Self {
        let verify_url = std::env::var("IDENTITY_VERIFY_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let dev_tokens = env_flag("IDENTITY_DEV_TOKENS", false);

        Self {
            verify_url,
            dev_tokens,
            host_emails: env_list("HOST_EMAILS"),
            host_domains: env_list("HOST_EMAIL_DOMAINS"),
        }
    }

    /// Pick the gate implementation. Remote verification wins when configured.
    pub fn build_gate(&self) -> Option<Arc<dyn IdentityGate>> {
        if let Some(url) = &self.verify_url {
            tracing::info!(verify_url = %url, "Using remote identity verification");
            return Some(Arc::new(HttpIdentityGate::new(url.clone())));
        }
        if self.dev_tokens {
            tracing::warn!(
                "Identity verification uses UNSIGNED dev tokens - anyone can claim any identity!"
            );
            return Some(Arc::new(DevIdentityGate));
        }
        None
    }

    pub fn classifier(&self) -> PrivilegeClassifier {
        PrivilegeClassifier::new(&self.host_emails, &self.host_domains)
    }
}

/// Shape returned by the remote verification endpoint
#[derive(Debug, Deserialize)]
struct VerifiedClaims {
    #[serde(alias = "sub")]
    uid: String,
    #[serde(default, alias = "displayName")]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

impl VerifiedClaims {
    fn into_identity(self) -> Result<Identity, IdentityError> {
        if self.uid.trim().is_empty() {
            return Err(IdentityError::Malformed("empty uid".to_string()));
        }
        let email = self.email.unwrap_or_default();
        let display_name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());

        Ok(Identity {
            uid: self.uid,
            display_name,
            email,
            picture: self.picture,
        })
    }
}

/// Verifies credentials against a remote HTTP endpoint
pub struct HttpIdentityGate {
    verify_url: String,
    client: reqwest::Client,
}

impl HttpIdentityGate {
    pub fn new(verify_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self { verify_url, client }
    }
}

#[async_trait]
impl IdentityGate for HttpIdentityGate {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::Missing);
        }

        let response = self
            .client
            .get(&self.verify_url)
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IdentityError::Rejected(format!(
                "verification endpoint answered {}",
                response.status()
            )));
        }

        let claims: VerifiedClaims = response
            .json()
            .await
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        claims.into_identity()
    }
}

/// Accepts `base64url(JSON identity)` without any signature check
pub struct DevIdentityGate;

impl DevIdentityGate {
    /// Build a token this gate will accept (used by local tooling and tests)
    pub fn token_for(identity: &Identity) -> String {
        let json = serde_json::to_vec(identity).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }
}

#[async_trait]
impl IdentityGate for DevIdentityGate {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::Missing);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim_end_matches('='))
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        let claims: VerifiedClaims =
            serde_json::from_slice(&bytes).map_err(|e| IdentityError::Malformed(e.to_string()))?;
        claims.into_identity()
    }
}

/// Derives the host/participant split from the shape of an email address.
///
/// An identity is privileged when its email is explicitly listed, or when its
/// domain is a host domain and the local part does not start with a digit.
#[derive(Debug, Clone, Default)]
pub struct PrivilegeClassifier {
    host_emails: HashSet<String>,
    host_domains: HashSet<String>,
}

impl PrivilegeClassifier {
    pub fn new(host_emails: &[String], host_domains: &[String]) -> Self {
        Self {
            host_emails: host_emails.iter().map(|e| e.to_lowercase()).collect(),
            host_domains: host_domains.iter().map(|d| d.to_lowercase()).collect(),
        }
    }

    pub fn is_privileged(&self, identity: &Identity) -> bool {
        let email = identity.email.trim().to_lowercase();
        if email.is_empty() {
            return false;
        }
        if self.host_emails.contains(&email) {
            return true;
        }

        let Some((local, domain)) = email.rsplit_once('@') else {
            return false;
        };
        self.host_domains.contains(domain)
            && local
                .chars()
                .next()
                .is_some_and(|c| !c.is_ascii_digit())
    }
}

//! Webhook-side admission filter.
//!
//! Decides whether a raw push event may become a signed [`Message`]. Checks
//! run in a fixed order and stop at the first failure:
//!
//! 1. the body parses as a push event,
//! 2. the repository has a configuration section,
//! 3. the pushed ref is the configured branch (skipped for bare mirrors),
//! 4. the declared signature matches an HMAC of the raw body.
//!
//! The signature check is never skipped. Repo and branch run first so that
//! no secret is selected for an unknown repository and nothing
//! secret-dependent is computed for events that are rejected anyway.
//!
//! [`Message`]: crate::message::Message

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::message::verify_hex_signature;

/// Public text for authorization rejections. Identical for every reason so
/// callers cannot probe which check failed.
pub const REJECTED_MESSAGE: &str = "Unknown repo or invalid signature";

/// Reasons an inbound event is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("repository {0} is not configured")]
    UnknownRepo(String),

    #[error("ref {reference} is not allowed for {repo}")]
    BranchNotAllowed { repo: String, reference: String },

    #[error("signature mismatch for {0}")]
    BadSignature(String),
}

impl AdmissionError {
    /// Text safe to return to the webhook sender.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "Invalid webhook payload",
            Self::UnknownRepo(_) | Self::BranchNotAllowed { .. } | Self::BadSignature(_) => {
                REJECTED_MESSAGE
            }
        }
    }

    /// `true` for malformed input, `false` for authorization rejections.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidPayload(_))
    }
}

/// The subset of a Gitea/Gogs/GitHub push event the deployer relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub reference: String,
    pub before: String,
    pub after: String,
    pub repository: EventRepository,
    #[serde(default)]
    pub pusher: EventPusher,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventRepository {
    pub full_name: String,
}

/// Pusher identity as reported by the forge. Provenance only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPusher {
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// GitHub reports the login as `name`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl EventPusher {
    pub fn login(&self) -> &str {
        self.login
            .as_deref()
            .or(self.username.as_deref())
            .or(self.name.as_deref())
            .unwrap_or_default()
    }
}

/// Gate between raw webhook bytes and message construction.
pub struct AdmissionFilter<'a> {
    config: &'a Config,
}

impl<'a> AdmissionFilter<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Run all admission checks over `raw` and the declared `signature`.
    pub fn admit(&self, raw: &[u8], signature: &str) -> Result<PushEvent, AdmissionError> {
        let event: PushEvent = serde_json::from_slice(raw).map_err(|e| {
            warn!("Rejecting webhook with invalid payload: {}", e);
            AdmissionError::InvalidPayload(e.to_string())
        })?;

        let repo_name = event.repository.full_name.as_str();
        let Some(repo) = self.config.repo(repo_name) else {
            warn!("Not an allowed repo: {}", repo_name);
            return Err(AdmissionError::UnknownRepo(repo_name.to_string()));
        };

        if !repo.bare {
            let allowed = repo.allowed_ref();
            if allowed.as_deref() != Some(event.reference.as_str()) {
                warn!(
                    "Not an allowed branch on {}: {} (allowed: {:?})",
                    repo_name, event.reference, allowed
                );
                return Err(AdmissionError::BranchNotAllowed {
                    repo: repo_name.to_string(),
                    reference: event.reference.clone(),
                });
            }
        }

        let declared = signature.trim();
        let declared = declared.strip_prefix("sha256=").unwrap_or(declared);
        if !verify_hex_signature(repo.secret.expose(), raw, declared) {
            warn!(
                "Invalid signature on request for {} - {}",
                repo_name, event.reference
            );
            return Err(AdmissionError::BadSignature(repo_name.to_string()));
        }

        debug!(
            "Admitted push to {} {} ({} -> {})",
            repo_name, event.reference, event.before, event.after
        );
        Ok(event)
    }
}

/// Convenience wrapper around [`AdmissionFilter::admit`].
pub fn admit(raw: &[u8], signature: &str, config: &Config) -> Result<PushEvent, AdmissionError> {
    AdmissionFilter::new(config).admit(raw, signature)
}

//! From raw webhook bytes to an HTTP-style outcome.
//!
//! Shared by the standalone server and the CGI front end. The core only
//! reports admission errors and the daemon's `(body, success)`; the status
//! codes are chosen here.

use autodeploy_common::admission::REJECTED_MESSAGE;
use autodeploy_common::{AdmissionFilter, Config, DaemonReply, Message, send_message};
use axum::http::StatusCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Headers that may carry the body signature, in order of preference.
pub const SIGNATURE_HEADERS: [&str; 3] = [
    "x-gitea-signature",
    "x-gogs-signature",
    "x-hub-signature-256",
];

/// Status and plain-text body returned to the webhook sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: StatusCode,
    pub body: String,
}

impl Outcome {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn from_reply(reply: DaemonReply) -> Self {
        if reply.success {
            Self::new(StatusCode::OK, reply.body)
        } else {
            Self::new(StatusCode::INTERNAL_SERVER_ERROR, reply.body)
        }
    }
}

/// Admits push events and forwards them to the daemon.
pub struct Receiver {
    config: Arc<Config>,
}

impl Receiver {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle one delivery: `raw` is the untouched body.
    pub async fn handle(&self, raw: &[u8], signature: Option<&str>) -> Outcome {
        let Some(signature) = signature.filter(|s| !s.trim().is_empty()) else {
            warn!("Rejecting webhook without signature");
            return Outcome::new(StatusCode::UNAUTHORIZED, "Missing signature");
        };

        let event = match AdmissionFilter::new(&self.config).admit(raw, signature) {
            Ok(event) => event,
            Err(err) => {
                let status = if err.is_client_error() {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::FORBIDDEN
                };
                return Outcome::new(status, err.public_message());
            }
        };

        let message = Message::from_event(&event);
        let Some(repo) = self.config.repo(&message.repo) else {
            return Outcome::new(StatusCode::FORBIDDEN, REJECTED_MESSAGE);
        };
        let payload = match message.sign(repo.secret.expose()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Cannot forward push for {}: {}", message.repo, err);
                return Outcome::new(
                    StatusCode::BAD_REQUEST,
                    format!("Cannot forward push: {err}"),
                );
            }
        };

        let socket = self.config.socket_for(&message.repo);
        info!(
            "Forwarding {} {} ({} -> {}) to {}",
            message.repo,
            message.branch,
            message.before,
            message.state,
            socket.display()
        );
        match send_message(socket, &payload, self.config.daemon.client_timeout()).await {
            Ok(reply) => {
                if !reply.success {
                    error!("Daemon reported failure for {}: {}", message.repo, reply.body);
                }
                Outcome::from_reply(reply)
            }
            Err(err) => {
                error!("Deploy daemon unavailable: {}", err);
                Outcome::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Deploy daemon unavailable: {err}"),
                )
            }
        }
    }
}

//! Signed sync message exchanged between the webhook receiver and the daemon.
//!
//! Wire format (UTF-8, `\n` separated, no trailing newline):
//!
//! ```text
//! <repo>
//! <branch>:<before>:<state>
//! <pusher_login>:<pusher_full_name>:<pusher_email>
//! <lowercase hex HMAC-SHA256 of the first three lines>
//! ```
//!
//! Fields may not contain `\n` or `:`. Both [`Message::sign`] and
//! [`Message::parse`] enforce this, so a crafted pusher name can never shift
//! the `before`/`state` pair of a signed payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::admission::PushEvent;

type HmacSha256 = Hmac<Sha256>;

/// Characters that structure the canonical payload.
pub const FIELD_DELIMITERS: [char; 2] = ['\n', ':'];

/// Errors produced while encoding or decoding a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("field `{field}` contains a reserved delimiter")]
    DelimiterInField { field: &'static str },
}

/// The minimal record describing one requested repository-state change.
///
/// Equality covers the seven data fields only; the digest is derived.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub repo: String,
    pub branch: String,
    pub before: String,
    pub state: String,
    pub pusher_login: String,
    pub pusher_full_name: String,
    pub pusher_email: String,
    digest: String,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.fields() == other.fields()
    }
}

impl Eq for Message {}

impl Message {
    /// Create an unsigned message without pusher provenance.
    pub fn new(
        repo: impl Into<String>,
        branch: impl Into<String>,
        before: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
            before: before.into(),
            state: state.into(),
            ..Self::default()
        }
    }

    /// Attach pusher provenance. Never used for authorization.
    pub fn with_pusher(
        mut self,
        login: impl Into<String>,
        full_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        self.pusher_login = login.into();
        self.pusher_full_name = full_name.into();
        self.pusher_email = email.into();
        self
    }

    /// Build the message for an event that already passed admission.
    pub fn from_event(event: &PushEvent) -> Self {
        Self::new(
            &event.repository.full_name,
            &event.reference,
            &event.before,
            &event.after,
        )
        .with_pusher(
            event.pusher.login(),
            event.pusher.full_name.as_deref().unwrap_or_default(),
            event.pusher.email.as_deref().unwrap_or_default(),
        )
    }

    /// Hex digest carried by a parsed message (empty for unsigned messages).
    pub fn digest(&self) -> &str {
        &self.digest
    }

    fn fields(&self) -> [(&'static str, &str); 7] {
        [
            ("repo", &self.repo),
            ("branch", &self.branch),
            ("before", &self.before),
            ("state", &self.state),
            ("pusher_login", &self.pusher_login),
            ("pusher_full_name", &self.pusher_full_name),
            ("pusher_email", &self.pusher_email),
        ]
    }

    fn check_fields(&self) -> Result<(), MessageError> {
        for (field, value) in self.fields() {
            if value.contains(FIELD_DELIMITERS) {
                return Err(MessageError::DelimiterInField { field });
            }
        }
        Ok(())
    }

    /// The exact byte sequence covered by the digest.
    pub fn canonical_payload(&self) -> String {
        format!(
            "{}\n{}:{}:{}\n{}:{}:{}",
            self.repo,
            self.branch,
            self.before,
            self.state,
            self.pusher_login,
            self.pusher_full_name,
            self.pusher_email
        )
    }

    /// Encode and sign the message with `secret`, ready for the wire.
    pub fn sign(&self, secret: &[u8]) -> Result<Vec<u8>, MessageError> {
        self.check_fields()?;
        let payload = self.canonical_payload();
        let digest = hex::encode(hmac_sha256(secret, payload.as_bytes()));

        let mut encoded = payload.into_bytes();
        encoded.push(b'\n');
        encoded.extend_from_slice(digest.as_bytes());
        Ok(encoded)
    }

    /// Decode a wire message. Does not check the digest; see [`Message::verify`].
    pub fn parse(bytes: &[u8]) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(bytes).map_err(|_| MessageError::InvalidUtf8)?;

        let lines: Vec<&str> = text.split('\n').collect();
        let [repo, refs, person, digest] = lines.as_slice() else {
            return Err(MessageError::Malformed("expected exactly four lines"));
        };
        if repo.is_empty() || repo.contains(':') {
            return Err(MessageError::Malformed("invalid repository line"));
        }
        if digest.is_empty() || digest.contains(':') {
            return Err(MessageError::Malformed("missing digest"));
        }

        let [branch, before, state] = split_triple(refs)?;
        let [login, full_name, email] = split_triple(person)?;

        Ok(Self {
            repo: repo.to_string(),
            branch: branch.to_string(),
            before: before.to_string(),
            state: state.to_string(),
            pusher_login: login.to_string(),
            pusher_full_name: full_name.to_string(),
            pusher_email: email.to_string(),
            digest: digest.to_string(),
        })
    }

    /// Check the carried digest against `secret` in constant time.
    pub fn verify(&self, secret: &[u8]) -> bool {
        if self.check_fields().is_err() {
            return false;
        }
        verify_hex_signature(secret, self.canonical_payload().as_bytes(), &self.digest)
    }
}

fn split_triple(line: &str) -> Result<[&str; 3], MessageError> {
    let parts: Vec<&str> = line.split(':').collect();
    match parts.as_slice() {
        [a, b, c] => Ok([a, b, c]),
        _ => Err(MessageError::Malformed("expected three `:` separated fields")),
    }
}

fn new_mac(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length")
}

/// Raw HMAC-SHA256 of `data` keyed with `secret`.
pub fn hmac_sha256(secret: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = new_mac(secret);
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compare a declared hex signature over `data` in constant time.
///
/// Accepts upper- or lowercase hex. Anything that does not decode to a full
/// 32-byte digest is rejected.
pub fn verify_hex_signature(secret: &[u8], data: &[u8], declared_hex: &str) -> bool {
    let Ok(declared) = hex::decode(declared_hex.trim()) else {
        return false;
    };
    let mut mac = new_mac(secret);
    mac.update(data);
    mac.verify_slice(&declared).is_ok()
}

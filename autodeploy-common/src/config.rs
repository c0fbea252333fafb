//! Configuration shared by the webhook receiver and the daemon.
//!
//! One TOML file with a `[daemon]` table for process-wide settings and one
//! `[repos."owner/name"]` table per deployable repository. The loader
//! validates everything up front; request handlers only ever see a complete,
//! immutable [`Config`] snapshot.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::message::FIELD_DELIMITERS;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/autodeploy.toml";

/// Default daemon socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/autodeploy.sock";

/// Default port of the standalone webhook server.
pub const DEFAULT_WEB_PORT: u16 = 6942;

/// Added on top of the daemon's own limits for the derived client timeout.
const CLIENT_TIMEOUT_SLACK_SECS: u64 = 60;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config for {section}: {reason}")]
    Invalid { section: String, reason: String },

    #[error("config file {path} is readable or writable by other users (mode {mode:o})")]
    InsecurePermissions { path: PathBuf, mode: u32 },
}

/// A shared signing key. Never printed.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DaemonSettings {
    /// Unix socket the daemon listens on.
    pub socket: PathBuf,
    /// trace, debug, info, warn or error.
    pub log_level: String,
    /// `stderr`, `stdout` or a file path.
    pub log_location: String,
    /// One JSON object per log line instead of text.
    pub log_json: bool,
    /// Port for `autodeploy serve`.
    pub web_port: u16,
    /// git executable.
    pub git: PathBuf,
    pub git_timeout_secs: u64,
    pub postscript_timeout_secs: u64,
    /// How long the receiver waits for the daemon's answer. Derived from the
    /// git and post-script limits when unset.
    pub client_timeout_secs: Option<u64>,
    /// sendmail-compatible binary; mail notifications are off when unset.
    pub sendmail: Option<PathBuf>,
    pub mail_from: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET_PATH),
            log_level: "info".to_string(),
            log_location: "stderr".to_string(),
            log_json: false,
            web_port: DEFAULT_WEB_PORT,
            git: PathBuf::from("git"),
            git_timeout_secs: 300,
            postscript_timeout_secs: 600,
            client_timeout_secs: None,
            sendmail: None,
            mail_from: "Deploy Daemon <root@localhost>".to_string(),
        }
    }
}

impl DaemonSettings {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn postscript_timeout(&self) -> Duration {
        Duration::from_secs(self.postscript_timeout_secs)
    }

    /// Explicit `client_timeout_secs`, or enough for a clone or fetch, a reset
    /// and a diff at the git limit plus the post-script at its limit.
    ///
    /// Time spent waiting for another sync of the same repository is not
    /// bounded by the daemon, so it is not covered either.
    pub fn client_timeout(&self) -> Duration {
        let secs = self.client_timeout_secs.unwrap_or_else(|| {
            self.git_timeout_secs
                .saturating_mul(3)
                .saturating_add(self.postscript_timeout_secs)
                .saturating_add(CLIENT_TIMEOUT_SLACK_SECS)
        });
        Duration::from_secs(secs)
    }
}

/// Trusted per-repository settings, keyed by the forge's `owner/name`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    pub secret: Secret,
    /// Checkout (or bare mirror) location.
    pub local: PathBuf,
    /// Remote to clone from when `local` does not exist yet.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub bare: bool,
    /// Branch name (or full `refs/heads/...` ref) allowed to deploy.
    #[serde(default)]
    pub branch: Option<String>,
    /// User that runs git and the post-script.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub postscript: Option<PathBuf>,
    /// Overrides `daemon.socket` for this repository.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    /// Extra notification recipients.
    #[serde(default)]
    pub notify: Vec<String>,
    /// Report a failing post-script as a failed sync.
    #[serde(default)]
    pub postscript_failure_is_error: bool,
}

impl RepositoryConfig {
    /// Full ref that may be deployed, `None` for bare mirrors without a branch.
    pub fn allowed_ref(&self) -> Option<String> {
        self.branch.as_deref().map(|branch| {
            if branch.starts_with("refs/") {
                branch.to_string()
            } else {
                format!("refs/heads/{branch}")
            }
        })
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            section: format!("repos.\"{name}\""),
            reason: reason.to_string(),
        };

        if name.is_empty() || name.contains(FIELD_DELIMITERS) {
            return Err(invalid("repository name may not be empty or contain ':' or newlines"));
        }
        if self.secret.is_empty() {
            return Err(invalid("secret must not be empty"));
        }
        if !self.local.is_absolute() {
            return Err(invalid("local must be an absolute path"));
        }
        if !self.bare && self.branch.as_deref().is_none_or(str::is_empty) {
            return Err(invalid("branch is required unless bare = true"));
        }
        if let Some(ref owner) = self.owner
            && owner.is_empty()
        {
            return Err(invalid("owner must not be empty"));
        }
        Ok(())
    }
}

/// Complete, validated configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub repos: BTreeMap<String, RepositoryConfig>,
}

impl Config {
    /// Parse and validate configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, refusing files other users can access.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mode = fs::metadata(path).map_err(io_err)?.permissions().mode();
        if mode & 0o006 != 0 {
            return Err(ConfigError::InsecurePermissions {
                path: path.to_path_buf(),
                mode: mode & 0o7777,
            });
        }

        let text = fs::read_to_string(path).map_err(io_err)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.socket.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                section: "daemon".to_string(),
                reason: "socket must not be empty".to_string(),
            });
        }
        for (name, repo) in &self.repos {
            repo.validate(name)?;
        }
        Ok(())
    }

    /// Look up the section for an exact `owner/name`.
    pub fn repo(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repos.get(name)
    }

    /// Socket the receiver should use for `repo`.
    pub fn socket_for(&self, repo: &str) -> &Path {
        self.repo(repo)
            .and_then(|r| r.socket.as_deref())
            .unwrap_or(&self.daemon.socket)
    }
}

/// Atomically replaceable configuration snapshot.
///
/// Readers take an `Arc<Config>` and keep using it for the whole request, so
/// a reload never exposes a half-updated section.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, config: Config) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }
}

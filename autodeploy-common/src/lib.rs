//! Shared protocol and configuration for autodeploy.
//!
//! The webhook receiver (`autodeploy`) and the privileged daemon
//! (`autodeployd`) only trust each other through what lives here: the signed
//! [`Message`] format, the Unix socket framing in [`transport`], and the
//! per-repository configuration both sides load independently.

pub mod admission;
pub mod config;
pub mod logging;
pub mod message;
pub mod transport;

pub use admission::{AdmissionError, AdmissionFilter, PushEvent, admit};
pub use config::{
    Config, ConfigError, DEFAULT_CONFIG_PATH, DaemonSettings, RepositoryConfig, Secret,
    SharedConfig,
};
pub use logging::{LogConfig, LogTarget, LoggingError, LoggingGuards, init_logging};
pub use message::{Message, MessageError};
pub use transport::{DaemonReply, SyncResponse, TransportError, send_message};

//! Deploy notifications.

use chrono::Local;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// How long sendmail may take to accept a message.
const SENDMAIL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to hand mail to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    Rejected {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{0} timed out")]
    TimedOut(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Builds a notification, dropping recipients that are not plain addresses.
    pub fn new<I, S>(to: I, subject: impl Into<String>, body: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut recipients: Vec<String> = Vec::new();
        for address in to {
            let address = address.as_ref().trim();
            if is_plain_address(address) && !recipients.iter().any(|r| r == address) {
                recipients.push(address.to_string());
            }
        }
        Self {
            to: recipients,
            subject: header_safe(&subject.into()),
            body: body.into(),
        }
    }

    /// RFC 5322 text handed to sendmail.
    pub fn render(&self, from: &str) -> String {
        format!(
            "From: {from}\nTo: {to}\nSubject: {subject}\nDate: {date}\nContent-Type: text/plain; charset=utf-8\n\n{body}\n",
            from = header_safe(from),
            to = self.to.join(", "),
            subject = self.subject,
            date = Local::now().to_rfc2822(),
            body = self.body,
        )
    }
}

/// `user@host` with nothing that could break a header or a command line.
fn is_plain_address(address: &str) -> bool {
    !address.is_empty()
        && !address.starts_with('-')
        && address.contains('@')
        && !address
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ',' | '<' | '>' | ';'))
}

fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

pub trait Notifier: Send + Sync + 'static {
    fn notify(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Writes the notification to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        debug!(
            "Notification for [{}]: {}",
            notification.to.join(", "),
            notification.subject
        );
        Ok(())
    }
}

/// Pipes the mail into a sendmail-compatible command.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub from: String,
}

impl SendmailNotifier {
    /// `program -t -i`: recipients from the headers, lone dots are not EOF.
    pub fn new(program: impl Into<PathBuf>, from: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec!["-t".to_string(), "-i".to_string()],
            from: from.into(),
        }
    }
}

impl Notifier for SendmailNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if notification.to.is_empty() {
            debug!("No recipients for '{}', not mailing", notification.subject);
            return Ok(());
        }

        let program = self.program.display().to_string();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NotifyError::Spawn {
                program: program.clone(),
                source,
            })?;

        let message = notification.render(&self.from);
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .map_err(|source| NotifyError::Io {
                    program: program.clone(),
                    source,
                })?;
        }

        let output = tokio::time::timeout(SENDMAIL_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| NotifyError::TimedOut(program.clone()))?
            .map_err(|source| NotifyError::Io {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(NotifyError::Rejected {
                program,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(
            "Mailed '{}' to {}",
            notification.subject,
            notification.to.join(", ")
        );
        Ok(())
    }
}

/// The notifier selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredNotifier {
    Log(LogNotifier),
    Sendmail(SendmailNotifier),
}

impl ConfiguredNotifier {
    pub fn from_settings(settings: &autodeploy_common::DaemonSettings) -> Self {
        match settings.sendmail {
            Some(ref program) => {
                Self::Sendmail(SendmailNotifier::new(program, settings.mail_from.clone()))
            }
            None => Self::Log(LogNotifier),
        }
    }
}

impl Notifier for ConfiguredNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        match self {
            Self::Log(inner) => inner.notify(notification).await,
            Self::Sendmail(inner) => inner.notify(notification).await,
        }
    }
}

/// Name used in notification subjects.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
pub mod recording {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every notification it receives.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }
}

//! Turning a verified message into a repository state change.
//!
//! Each request moves through `Decode -> Authorize -> Reconcile -> Respond`.
//! Decode and Authorize never touch the filesystem. Reconcile runs under the
//! repository's lock, including the post-script, so two pushes to the same
//! checkout can never interleave their git commands.

use autodeploy_common::{
    DaemonSettings, Message, MessageError, RepositoryConfig, SharedConfig, SyncResponse,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::git::{GitError, GitOptions, GitRepo, is_commit_id, is_null_commit, same_commit};
use crate::locks::RepoLocks;
use crate::notify::{self, Notification, Notifier};
use crate::postscript::{PostScriptOutcome, run_postscript};
use crate::runner::CommandRunner;

/// Where in the request lifecycle something happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitRequest,
    Decode,
    Authorize,
    Reconcile,
    Respond,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitRequest => write!(f, "await_request"),
            Self::Decode => write!(f, "decode"),
            Self::Authorize => write!(f, "authorize"),
            Self::Reconcile => write!(f, "reconcile"),
            Self::Respond => write!(f, "respond"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed message")]
    MalformedMessage(#[source] MessageError),

    #[error("unknown repository '{0}'")]
    UnknownRepo(String),

    #[error("invalid signature for '{0}'")]
    UnauthorizedMessage(String),

    #[error("refusing target commit '{0}'")]
    InvalidRevision(String),

    #[error("push deletes {0}; the checkout was left untouched")]
    BranchDeleted(String),

    #[error("{source}\nlast known HEAD: {}", .last_known_head.as_deref().unwrap_or("unknown"))]
    Git {
        source: GitError,
        last_known_head: Option<String>,
    },

    #[error("post-script failed\n{report}")]
    PostScriptFailed { report: Box<SyncReport> },
}

impl SyncError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::MalformedMessage(_) => Stage::Decode,
            Self::UnknownRepo(_) | Self::UnauthorizedMessage(_) => Stage::Authorize,
            Self::InvalidRevision(_)
            | Self::BranchDeleted(_)
            | Self::Git { .. }
            | Self::PostScriptFailed { .. } => Stage::Reconcile,
        }
    }
}

/// What reconciliation observed and changed in a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// `HEAD` before the reset, `None` if it could not be resolved.
    pub observed_head: Option<String>,
    /// Whether `observed_head` was the commit the request expected.
    pub before_matched: bool,
    pub final_head: Option<String>,
    pub checked_out_branch: Option<String>,
    pub diff_stat: Option<String>,
}

/// Summary of a successful sync, sent back as the `OK` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub repo: String,
    pub local: PathBuf,
    pub branch: String,
    pub before: String,
    pub state: String,
    pub bare: bool,
    pub reconciliation: Option<ReconciliationResult>,
    pub postscript: Option<PostScriptOutcome>,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bare {
            writeln!(f, "Mirrored {} into {}", self.repo, self.local.display())?;
        } else {
            writeln!(f, "Deployed {} to {}", self.repo, self.local.display())?;
        }
        writeln!(f, "branch: {}", self.branch)?;
        writeln!(f, "state: {}", self.state)?;

        if let Some(ref r) = self.reconciliation {
            let observed = r.observed_head.as_deref().unwrap_or("unknown");
            writeln!(f, "previous: {observed}")?;
            if !r.before_matched {
                writeln!(
                    f,
                    "WARNING: checkout was at {observed}, push expected {}",
                    self.before
                )?;
            }
            if let Some(ref head) = r.final_head {
                writeln!(f, "now: {head}")?;
            }
            if let Some(ref branch) = r.checked_out_branch {
                writeln!(f, "checked out: {branch}")?;
            }
            if let Some(ref diff) = r.diff_stat
                && !diff.trim().is_empty()
            {
                writeln!(f, "{}", diff.trim_end())?;
            }
        }

        if let Some(ref outcome) = self.postscript {
            writeln!(
                f,
                "post-script {} {}",
                outcome.script.display(),
                outcome.status()
            )?;
            if !outcome.output.trim().is_empty() {
                writeln!(f, "{}", outcome.output.trim_end())?;
            }
        }
        Ok(())
    }
}

/// Handles decoded requests against the current configuration snapshot.
pub struct SyncService<R, N> {
    config: SharedConfig,
    locks: RepoLocks,
    runner: Arc<R>,
    notifier: Arc<N>,
    hostname: String,
}

impl<R, N> Clone for SyncService<R, N> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            locks: self.locks.clone(),
            runner: Arc::clone(&self.runner),
            notifier: Arc::clone(&self.notifier),
            hostname: self.hostname.clone(),
        }
    }
}

impl<R: CommandRunner, N: Notifier> SyncService<R, N> {
    pub fn new(config: SharedConfig, runner: Arc<R>, notifier: Arc<N>) -> Self {
        Self {
            config,
            locks: RepoLocks::new(),
            runner,
            notifier,
            hostname: notify::hostname(),
        }
    }

    #[cfg(test)]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Full request handling: never fails, errors become `ERROR` responses.
    pub async fn handle_request(&self, raw: &[u8]) -> SyncResponse {
        match self.process(raw).await {
            Ok(report) => {
                info!(
                    repo = %report.repo,
                    state = %report.state,
                    "Sync finished"
                );
                SyncResponse::Ok(report.to_string())
            }
            Err(err) => {
                match err.stage() {
                    Stage::Decode | Stage::Authorize => {
                        warn!(stage = %err.stage(), "Rejected request: {}", err)
                    }
                    _ => error!(stage = %err.stage(), "Sync failed: {}", err),
                }
                SyncResponse::Error(err.to_string())
            }
        }
    }

    /// Decode, authorize and reconcile one raw request.
    pub async fn process(&self, raw: &[u8]) -> Result<SyncReport, SyncError> {
        let config = self.config.snapshot();

        let message = Message::parse(raw).map_err(SyncError::MalformedMessage)?;
        debug!(repo = %message.repo, "Decoded request");

        let repo = config
            .repo(&message.repo)
            .ok_or_else(|| SyncError::UnknownRepo(message.repo.clone()))?;
        if !message.verify(repo.secret.expose()) {
            return Err(SyncError::UnauthorizedMessage(message.repo.clone()));
        }

        let result = self.reconcile(&config.daemon, repo, &message).await;
        self.notify(repo, &message, &result).await;
        result
    }

    async fn reconcile(
        &self,
        settings: &DaemonSettings,
        repo: &RepositoryConfig,
        message: &Message,
    ) -> Result<SyncReport, SyncError> {
        if !repo.bare {
            if !is_commit_id(&message.state) {
                return Err(SyncError::InvalidRevision(message.state.clone()));
            }
            if is_null_commit(&message.state) {
                return Err(SyncError::BranchDeleted(message.branch.clone()));
            }
        }

        let _guard = match self.locks.try_lock(&repo.local) {
            Some(guard) => guard,
            None => {
                info!(
                    "Waiting for the running sync of {}",
                    repo.local.display()
                );
                self.locks.lock(&repo.local).await
            }
        };

        let options = GitOptions {
            git: settings.git.clone(),
            owner: repo.owner.clone(),
            timeout: settings.git_timeout(),
        };
        let git = GitRepo::open(
            &repo.local,
            repo.url.as_deref(),
            repo.bare,
            options,
            self.runner.as_ref(),
        )
        .await
        .map_err(|source| SyncError::Git {
            source,
            last_known_head: None,
        })?;

        let reconciliation = if repo.bare {
            git.fetch().await.map_err(|source| SyncError::Git {
                source,
                last_known_head: None,
            })?;
            None
        } else {
            Some(reconcile_checkout(&git, message).await?)
        };

        let postscript = match repo.postscript {
            Some(ref script) => Some(
                run_postscript(
                    self.runner.as_ref(),
                    script,
                    &repo.local,
                    repo.owner.as_deref(),
                    settings.postscript_timeout(),
                )
                .await,
            ),
            None => None,
        };

        let report = SyncReport {
            repo: message.repo.clone(),
            local: repo.local.clone(),
            branch: message.branch.clone(),
            before: message.before.clone(),
            state: message.state.clone(),
            bare: repo.bare,
            reconciliation,
            postscript,
        };

        if repo.postscript_failure_is_error
            && report.postscript.as_ref().is_some_and(|o| !o.succeeded())
        {
            return Err(SyncError::PostScriptFailed {
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    async fn notify(
        &self,
        repo: &RepositoryConfig,
        message: &Message,
        result: &Result<SyncReport, SyncError>,
    ) {
        let (subject, summary) = match result {
            Ok(report) => (
                format!("Git deploy done for {} on {}", message.repo, self.hostname),
                report.to_string(),
            ),
            Err(err) => (
                format!("Git deploy FAILED for {} on {}", message.repo, self.hostname),
                err.to_string(),
            ),
        };
        let body = format!(
            "{}\n\nPushed by {} <{}> ({})\n",
            summary.trim_end(),
            message.pusher_full_name,
            message.pusher_email,
            message.pusher_login
        );
        let recipients = std::iter::once(message.pusher_email.as_str())
            .chain(repo.notify.iter().map(String::as_str));
        let notification = Notification::new(recipients, subject, body);

        if let Err(err) = self.notifier.notify(&notification).await {
            warn!("Notification for {} failed: {}", message.repo, err);
        }
    }
}

/// Fetch, compare, reset and diff a working checkout.
async fn reconcile_checkout<R: CommandRunner>(
    git: &GitRepo<'_, R>,
    message: &Message,
) -> Result<ReconciliationResult, SyncError> {
    if let Err(source) = git.fetch().await {
        return Err(git_failure(git, source).await);
    }

    let observed_head = match git.resolve_ref("HEAD").await {
        Ok(head) => head,
        Err(source) => return Err(git_failure(git, source).await),
    };
    let before_matched = observed_head
        .as_deref()
        .is_some_and(|head| same_commit(head, &message.before));
    if !before_matched {
        warn!(
            repo = %message.repo,
            "{} is at {}, push expected {}",
            git.path().display(),
            observed_head.as_deref().unwrap_or("unknown"),
            message.before
        );
    }

    let checked_out_branch = git.current_branch().await.unwrap_or_else(|err| {
        debug!("Could not read the checked-out branch: {}", err);
        None
    });
    if let Some(ref branch) = checked_out_branch
        && message.branch.strip_prefix("refs/heads/") != Some(branch.as_str())
    {
        warn!(
            repo = %message.repo,
            "Checkout is on {}, resetting it to a commit from {}",
            branch,
            message.branch
        );
    }

    if let Err(source) = git.force_reset(&message.state).await {
        return Err(git_failure(git, source).await);
    }
    let final_head = match git.resolve_ref("HEAD").await {
        Ok(head) => head,
        Err(source) => return Err(git_failure(git, source).await),
    };

    // The zero id of a new branch or a pruned commit has nothing to diff.
    let diff_stat = match git.diff_stat(&message.before, &message.state).await {
        Ok(stat) => Some(stat),
        Err(err) => {
            debug!(
                "No diff between {} and {}: {}",
                message.before, message.state, err
            );
            None
        }
    };

    Ok(ReconciliationResult {
        observed_head,
        before_matched,
        final_head,
        checked_out_branch,
        diff_stat,
    })
}

/// Wrap a git failure with whatever `HEAD` currently is.
async fn git_failure<R: CommandRunner>(git: &GitRepo<'_, R>, source: GitError) -> SyncError {
    let last_known_head = git.resolve_ref("HEAD").await.ok().flatten();
    SyncError::Git {
        source,
        last_known_head,
    }
}

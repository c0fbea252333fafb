//! Repository adapter: the git operations a sync needs, run as subprocesses.
//!
//! Commit ids coming from a request are checked before they reach the git
//! command line, so a value can never be read as an option.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::runner::{CommandOutput, CommandRunner, Invocation, RunError};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("`{command}` failed in {path}:\n{output}")]
    OperationFailed {
        command: String,
        path: PathBuf,
        output: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("{0} exists but is not a bare repository")]
    NotBare(PathBuf),

    #[error("{0} does not exist and no url is configured to clone it from")]
    MissingRemote(PathBuf),

    #[error("refusing revision '{0}'")]
    InvalidRevision(String),

    #[error("could not switch to owner: {0}")]
    OwnerLookup(#[source] RunError),

    #[error(transparent)]
    Spawn(RunError),
}

impl GitError {
    fn from_run(command: &Invocation, err: RunError) -> Self {
        match err {
            RunError::TimedOut { timeout, .. } => Self::TimedOut {
                command: command.display(),
                timeout,
            },
            RunError::UnknownOwner(_) | RunError::OwnerLookup { .. } => Self::OwnerLookup(err),
            RunError::Spawn { .. } | RunError::Io { .. } => Self::Spawn(err),
        }
    }
}

/// How git is invoked for one repository.
#[derive(Debug, Clone)]
pub struct GitOptions {
    pub git: PathBuf,
    pub owner: Option<String>,
    pub timeout: Duration,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
            owner: None,
            timeout: Duration::from_secs(300),
        }
    }
}

/// True for 4 to 64 hex digits, i.e. an abbreviated or full object id.
pub fn is_commit_id(value: &str) -> bool {
    (4..=64).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// The all-zero id a forge sends as `after` when a branch is deleted.
pub fn is_null_commit(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b == b'0')
}

/// Whether two object ids name the same commit, allowing abbreviation.
pub fn same_commit(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    !short.is_empty()
        && long
            .get(..short.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(short))
}

/// A local checkout or bare mirror.
pub struct GitRepo<'r, R> {
    path: PathBuf,
    bare: bool,
    options: GitOptions,
    runner: &'r R,
}

impl<'r, R: CommandRunner> GitRepo<'r, R> {
    /// Open the repository at `path`, cloning it first when it is missing.
    ///
    /// An existing path configured as bare must really be a bare repository.
    pub async fn open(
        path: &Path,
        remote_url: Option<&str>,
        bare: bool,
        options: GitOptions,
        runner: &'r R,
    ) -> Result<Self, GitError> {
        let repo = Self {
            path: path.to_path_buf(),
            bare,
            options,
            runner,
        };
        repo.ensure_cloned(remote_url).await?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_cloned(&self, remote_url: Option<&str>) -> Result<(), GitError> {
        if self.path.exists() {
            if self.bare {
                let output = self
                    .checked(&self.path, &["rev-parse", "--is-bare-repository"])
                    .await?;
                if output.trim() != "true" {
                    return Err(GitError::NotBare(self.path.clone()));
                }
            }
            return Ok(());
        }

        let url = remote_url.ok_or_else(|| GitError::MissingRemote(self.path.clone()))?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| GitError::MissingRemote(self.path.clone()))?;
        let target = self.path.to_string_lossy().into_owned();

        let mut args = vec!["clone", "--quiet"];
        if self.bare {
            args.push("--bare");
        }
        args.extend(["--", url, target.as_str()]);

        info!("Cloning {} into {}", url, self.path.display());
        self.checked(parent, &args).await?;
        Ok(())
    }

    /// Update remote-tracking state. Bare mirrors take every branch and tag.
    pub async fn fetch(&self) -> Result<(), GitError> {
        if self.bare {
            self.checked(
                &self.path,
                &[
                    "fetch",
                    "--quiet",
                    "--prune",
                    "origin",
                    "+refs/heads/*:refs/heads/*",
                    "+refs/tags/*:refs/tags/*",
                ],
            )
            .await?;
        } else {
            self.checked(&self.path, &["fetch", "--quiet", "--prune"])
                .await?;
        }
        Ok(())
    }

    /// Resolve a ref to a commit id, `None` when it does not exist.
    pub async fn resolve_ref(&self, reference: &str) -> Result<Option<String>, GitError> {
        if reference.is_empty() || reference.starts_with('-') {
            return Err(GitError::InvalidRevision(reference.to_string()));
        }
        let spec = format!("{reference}^{{commit}}");
        let invocation = self.invocation(&self.path, &["rev-parse", "--verify", "--quiet", &spec]);
        let output = self.run(&invocation).await?;

        match output.exit_code {
            Some(0) => Ok(Some(output.output.trim().to_string())),
            // --verify --quiet exits 1 without output for unknown refs
            Some(1) if output.output.trim().is_empty() => Ok(None),
            _ => Err(failed(&invocation, output)),
        }
    }

    /// Move `HEAD`, the index and the working tree to `commit`.
    pub async fn force_reset(&self, commit: &str) -> Result<(), GitError> {
        require_commit_id(commit)?;
        debug!("Resetting {} to {}", self.path.display(), commit);
        self.checked(&self.path, &["reset", "--hard", "--quiet", commit])
            .await?;
        Ok(())
    }

    /// `git diff --stat a b`.
    pub async fn diff_stat(&self, from: &str, to: &str) -> Result<String, GitError> {
        require_commit_id(from)?;
        require_commit_id(to)?;
        self.checked(&self.path, &["diff", "--stat", from, to]).await
    }

    /// Short name of the checked-out branch, `None` when `HEAD` is detached.
    pub async fn current_branch(&self) -> Result<Option<String>, GitError> {
        let invocation = self.invocation(&self.path, &["symbolic-ref", "--short", "-q", "HEAD"]);
        let output = self.run(&invocation).await?;
        match output.exit_code {
            Some(0) => Ok(Some(output.output.trim().to_string())),
            Some(1) => Ok(None),
            _ => Err(failed(&invocation, output)),
        }
    }

    // ── Invocation helpers ──────────────────────────────────────────────

    fn invocation(&self, cwd: &Path, args: &[&str]) -> Invocation {
        Invocation::new(&self.options.git, cwd)
            .args(args.iter().copied())
            .owner(self.options.owner.as_deref())
            .timeout(self.options.timeout)
    }

    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, GitError> {
        self.runner
            .run(invocation)
            .await
            .map_err(|err| GitError::from_run(invocation, err))
    }

    async fn checked(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let invocation = self.invocation(cwd, args);
        let output = self.run(&invocation).await?;
        if output.success() {
            Ok(output.output)
        } else {
            Err(failed(&invocation, output))
        }
    }
}

fn require_commit_id(value: &str) -> Result<(), GitError> {
    if is_commit_id(value) {
        Ok(())
    } else {
        Err(GitError::InvalidRevision(value.to_string()))
    }
}

fn failed(invocation: &Invocation, output: CommandOutput) -> GitError {
    GitError::OperationFailed {
        command: invocation.display(),
        path: invocation.cwd.clone(),
        output: output.output,
    }
}

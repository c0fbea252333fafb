//! Subprocess execution for git and post-deploy scripts.
//!
//! Everything the daemon runs goes through [`CommandRunner`], so tests can
//! swap in a recording double and production can enforce timeouts and owner
//! impersonation in one place.

use nix::unistd::User;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

/// A single program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Run as this user instead of the daemon's own identity.
    pub owner: Option<String>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            owner: None,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn owner(mut self, owner: Option<&str>) -> Self {
        self.owner = owner.map(str::to_string);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `program arg1 arg2`, for logs and error messages.
    pub fn display(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

/// Exit status plus captured stdout followed by stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// `output` holds whatever the child printed before it was killed.
    #[error("{program} timed out after {timeout:?}")]
    TimedOut {
        program: String,
        timeout: Duration,
        output: String,
    },

    #[error("unknown owner '{0}'")]
    UnknownOwner(String),

    #[error("failed to look up owner '{owner}': {source}")]
    OwnerLookup {
        owner: String,
        #[source]
        source: nix::Error,
    },
}

/// Executes invocations. Implementations must be shareable across handlers.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<CommandOutput, RunError>> + Send;
}

/// Runs real child processes with a deadline; children are killed on timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, RunError> {
        let program = invocation.program.display().to_string();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref owner) = invocation.owner {
            let user = User::from_name(owner)
                .map_err(|source| RunError::OwnerLookup {
                    owner: owner.clone(),
                    source,
                })?
                .ok_or_else(|| RunError::UnknownOwner(owner.clone()))?;
            command
                .uid(user.uid.as_raw())
                .gid(user.gid.as_raw())
                .env("HOME", &user.dir)
                .env("USER", &user.name)
                .env("LOGNAME", &user.name);
        }

        debug!(
            "Running `{}` in {}",
            invocation.display(),
            invocation.cwd.display()
        );
        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout = Mutex::new(Vec::new());
        let stderr = Mutex::new(Vec::new());
        let finished = tokio::time::timeout(invocation.timeout, async {
            let (status, (), ()) = tokio::join!(
                child.wait(),
                drain(stdout_pipe, &stdout),
                drain(stderr_pipe, &stderr),
            );
            status
        })
        .await;

        let mut combined = String::from_utf8_lossy(&take(stdout)).into_owned();
        combined.push_str(&String::from_utf8_lossy(&take(stderr)));

        match finished {
            Ok(Ok(status)) => Ok(CommandOutput {
                exit_code: status.code(),
                output: combined,
            }),
            Ok(Err(source)) => Err(RunError::Io { program, source }),
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    debug!("Could not kill {}: {}", program, e);
                }
                Err(RunError::TimedOut {
                    program,
                    timeout: invocation.timeout,
                    output: combined,
                })
            }
        }
    }
}

/// Copy `pipe` into `sink` chunk by chunk so a timeout keeps what was read.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, sink: &Mutex<Vec<u8>>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]),
        }
    }
}

fn take(buffer: Mutex<Vec<u8>>) -> Vec<u8> {
    buffer.into_inner().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_stderr_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new("sh", dir.path())
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .timeout(Duration::from_secs(10));

        let output = ProcessRunner.run(&invocation).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let invocation = Invocation::new("ls", dir.path());

        let output = ProcessRunner.run(&invocation).await.unwrap();
        assert!(output.success());
        assert!(output.output.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new("sleep", dir.path())
            .args(["5"])
            .timeout(Duration::from_millis(100));

        let err = ProcessRunner.run(&invocation).await.unwrap_err();
        assert!(matches!(err, RunError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_timeout_keeps_output_printed_so_far() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new("sh", dir.path())
            .args(["-c", "echo building; echo warming cache >&2; exec sleep 5"])
            .timeout(Duration::from_millis(500));

        match ProcessRunner.run(&invocation).await.unwrap_err() {
            RunError::TimedOut { output, .. } => {
                assert!(output.contains("building"));
                assert!(output.contains("warming cache"));
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new("/nonexistent/autodeploy-test-binary", dir.path());

        let err = ProcessRunner.run(&invocation).await.unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_unknown_owner_is_rejected_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let invocation =
            Invocation::new("true", dir.path()).owner(Some("autodeploy-no-such-user-xyz"));

        let err = ProcessRunner.run(&invocation).await.unwrap_err();
        assert!(matches!(err, RunError::UnknownOwner(_)));
    }

    #[test]
    fn test_display_joins_program_and_args() {
        let invocation = Invocation::new("git", "/srv").args(["reset", "--hard", "abc123"]);
        assert_eq!(invocation.display(), "git reset --hard abc123");
    }
}

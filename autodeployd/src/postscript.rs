//! Optional post-deploy hook.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::runner::{CommandRunner, Invocation, RunError};

/// What happened when the post-script ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostScriptOutcome {
    pub script: PathBuf,
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

impl PostScriptOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// One-line status for reports.
    pub fn status(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exited with {code}"),
                None => "did not exit normally".to_string(),
            }
        }
    }
}

/// Run `script <local>` inside `local` as `owner`.
///
/// Never fails: a script that cannot start or times out is reported in the
/// outcome like any other failure.
pub async fn run_postscript<R: CommandRunner>(
    runner: &R,
    script: &Path,
    local: &Path,
    owner: Option<&str>,
    timeout: Duration,
) -> PostScriptOutcome {
    let invocation = Invocation::new(script, local)
        .args([local.to_string_lossy().into_owned()])
        .owner(owner)
        .timeout(timeout);

    let outcome = match runner.run(&invocation).await {
        Ok(output) => PostScriptOutcome {
            script: script.to_path_buf(),
            exit_code: output.exit_code,
            output: output.output,
            timed_out: false,
        },
        Err(RunError::TimedOut { output, .. }) => PostScriptOutcome {
            script: script.to_path_buf(),
            exit_code: None,
            output,
            timed_out: true,
        },
        Err(err) => PostScriptOutcome {
            script: script.to_path_buf(),
            exit_code: None,
            output: err.to_string(),
            timed_out: false,
        },
    };

    if outcome.succeeded() {
        info!("Post-script {} finished", script.display());
    } else {
        warn!("Post-script {} {}", script.display(), outcome.status());
    }
    outcome
}

//! In-memory stand-in for git and post-scripts used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::runner::{CommandOutput, CommandRunner, Invocation, RunError};

#[derive(Debug, Clone)]
pub struct Call {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub owner: Option<String>,
    pub started: Instant,
    pub finished: Instant,
}

impl Call {
    pub fn is_git(&self) -> bool {
        self.program.file_name().is_some_and(|name| name == "git")
    }
}

#[derive(Debug, Default)]
struct State {
    heads: HashMap<PathBuf, String>,
    bare: HashSet<PathBuf>,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    calls: Vec<Call>,
}

#[derive(Debug, Clone)]
enum ScriptBehavior {
    Exit(i32, String),
    TimeOut,
}

/// Simulates git by keeping one `HEAD` per working directory.
#[derive(Debug)]
pub struct FakeGit {
    state: Mutex<State>,
    delay: Duration,
    initial_head: Option<String>,
    script: ScriptBehavior,
}

impl FakeGit {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            delay: Duration::ZERO,
            initial_head: None,
            script: ScriptBehavior::Exit(0, "post-script ran\n".to_string()),
        }
    }

    /// Every command sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `HEAD` of freshly cloned checkouts.
    pub fn with_clone_head(mut self, head: &str) -> Self {
        self.initial_head = Some(head.to_string());
        self
    }

    pub fn with_bare(self, path: &Path) -> Self {
        self.lock().bare.insert(path.to_path_buf());
        self
    }

    /// Make every `git <subcommand>` exit 128.
    pub fn failing(self, subcommand: &str) -> Self {
        self.lock().failing.insert(subcommand.to_string());
        self
    }

    /// Make every `git <subcommand>` hit its timeout.
    pub fn timing_out(self, subcommand: &str) -> Self {
        self.lock().hanging.insert(subcommand.to_string());
        self
    }

    pub fn with_script_exit(mut self, code: i32, output: &str) -> Self {
        self.script = ScriptBehavior::Exit(code, output.to_string());
        self
    }

    pub fn with_script_timeout(mut self) -> Self {
        self.script = ScriptBehavior::TimeOut;
        self
    }

    pub fn set_head(&self, path: &Path, head: &str) {
        self.lock().heads.insert(path.to_path_buf(), head.to_string());
    }

    pub fn head(&self, path: &Path) -> Option<String> {
        self.lock().heads.get(path).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// git calls whose subcommand is `subcommand`.
    pub fn calls_matching(&self, subcommand: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.is_git() && c.args.first().is_some_and(|a| a == subcommand))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn answer(&self, invocation: &Invocation) -> Result<CommandOutput, RunError> {
        let is_git = invocation
            .program
            .file_name()
            .is_some_and(|name| name == "git");
        if !is_git {
            return match &self.script {
                ScriptBehavior::Exit(code, output) => Ok(CommandOutput {
                    exit_code: Some(*code),
                    output: output.clone(),
                }),
                ScriptBehavior::TimeOut => Err(RunError::TimedOut {
                    program: invocation.program.display().to_string(),
                    timeout: invocation.timeout,
                    output: String::new(),
                }),
            };
        }

        let mut state = self.lock();
        let subcommand = invocation.args.first().map(String::as_str).unwrap_or("");
        if state.failing.contains(subcommand) {
            return Ok(exit(128, &format!("fatal: simulated {subcommand} failure\n")));
        }
        if state.hanging.contains(subcommand) {
            return Err(RunError::TimedOut {
                program: invocation.program.display().to_string(),
                timeout: invocation.timeout,
                output: String::new(),
            });
        }

        let last = invocation.args.last().cloned().unwrap_or_default();
        let output = match subcommand {
            "clone" => {
                let target = PathBuf::from(&last);
                std::fs::create_dir_all(&target).map_err(|source| RunError::Io {
                    program: "git".to_string(),
                    source,
                })?;
                if invocation.args.iter().any(|a| a == "--bare") {
                    state.bare.insert(target.clone());
                }
                if let Some(ref head) = self.initial_head {
                    state.heads.insert(target, head.clone());
                }
                exit(0, "")
            }
            "rev-parse" if invocation.args.iter().any(|a| a == "--is-bare-repository") => {
                let bare = state.bare.contains(&invocation.cwd);
                exit(0, if bare { "true\n" } else { "false\n" })
            }
            "rev-parse" => {
                let reference = last.trim_end_matches("^{commit}");
                let resolved = if reference == "HEAD" {
                    state.heads.get(&invocation.cwd).cloned()
                } else if crate::git::is_commit_id(reference) {
                    Some(reference.to_string())
                } else {
                    None
                };
                match resolved {
                    Some(commit) => exit(0, &format!("{commit}\n")),
                    None => exit(1, ""),
                }
            }
            "reset" => {
                state.heads.insert(invocation.cwd.clone(), last);
                exit(0, "")
            }
            "diff" => exit(0, " index.html | 2 +-\n 1 file changed, 1 insertion(+), 1 deletion(-)\n"),
            "symbolic-ref" => exit(0, "main\n"),
            _ => exit(0, ""),
        };
        Ok(output)
    }
}

fn exit(code: i32, output: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        output: output.to_string(),
    }
}

impl CommandRunner for FakeGit {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, RunError> {
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = self.answer(invocation);
        self.lock().calls.push(Call {
            program: invocation.program.clone(),
            args: invocation.args.clone(),
            cwd: invocation.cwd.clone(),
            owner: invocation.owner.clone(),
            started,
            finished: Instant::now(),
        });
        result
    }
}

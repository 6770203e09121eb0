//! Helpers shared by the built-in task bodies: running commands and
//! checking out the revision under test.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::domain::TaskOutcome;
use crate::typed::BodyError;

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, the way a terminal would interleave them
    /// for a sequential tool.
    pub fn combined(&self) -> String {
        let mut log = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(&self.stderr);
        }
        log
    }

    pub fn code_string(&self) -> String {
        self.code.map_or_else(|| "signal".to_string(), |c| c.to_string())
    }
}

/// Run `program args...` in `dir` and capture its output.
pub async fn run_command(
    program: &str,
    args: &[&str],
    dir: &Path,
) -> Result<CommandOutput, BodyError> {
    debug!(program, dir = %dir.display(), "running command");
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BodyError::io(format!("failed to run {program}"), e))?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a shell snippet in `dir`.
pub async fn run_shell(script: &str, dir: &Path) -> Result<CommandOutput, BodyError> {
    run_command("sh", &["-c", script], dir).await
}

/// Revision to test, as given in a task's kwargs.
///
/// `base_repo_url` and `base_repo_ref` come as a pair: when present, the base
/// is merged into the checkout, simulating a pull-request merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SourceSpec {
    #[serde(default)]
    pub sha: Option<String>,

    #[serde(default)]
    pub git_url: Option<String>,

    #[serde(default)]
    pub base_repo_url: Option<String>,

    #[serde(default)]
    pub base_repo_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeBase {
    pub url: String,
    pub reference: String,
}

/// A validated [`SourceSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub sha: String,
    pub git_url: String,
    pub base: Option<MergeBase>,
}

impl SourceSpec {
    /// Check the kwargs; the error is the failure reason to report.
    pub fn validate(&self) -> Result<Checkout, &'static str> {
        let sha = self.sha.clone().ok_or("missing revision id")?;
        let git_url = self.git_url.clone().ok_or("missing git url")?;
        let base = match (&self.base_repo_url, &self.base_repo_ref) {
            (Some(url), Some(reference)) => Some(MergeBase {
                url: url.clone(),
                reference: reference.clone(),
            }),
            (None, None) => None,
            _ => return Err("incomplete base specification for merge"),
        };
        Ok(Checkout { sha, git_url, base })
    }
}

impl Checkout {
    /// Clone into `<work_dir>/<sha>`, check out `sha` and merge the base if
    /// one is given. A failing git step is a failed outcome, not an error.
    pub async fn fetch(&self, work_dir: &Path) -> Result<PathBuf, TaskOutcome> {
        let target = work_dir.join(&self.sha);
        let target_arg = target.to_string_lossy().into_owned();

        let clone = run_command("git", &["clone", self.git_url.as_str(), target_arg.as_str()], work_dir)
            .await
            .map_err(|e| TaskOutcome::failure("git clone failed").with_field("log", e.to_string()))?;
        if !clone.success() {
            return Err(git_failure("git clone failed", &clone));
        }

        let checkout = run_command("git", &["checkout", self.sha.as_str()], &target)
            .await
            .map_err(|e| TaskOutcome::failure("git clone failed").with_field("log", e.to_string()))?;
        if !checkout.success() {
            return Err(git_failure("git clone failed", &checkout));
        }

        if let Some(base) = &self.base {
            let merge = self.merge(base, &target).await.map_err(|e| {
                TaskOutcome::failure("git merge failed").with_field("log", e.to_string())
            })?;
            if !merge.success() {
                return Err(git_failure("git merge failed", &merge));
            }
        }

        Ok(target)
    }

    async fn merge(&self, base: &MergeBase, checkout: &Path) -> Result<CommandOutput, BodyError> {
        let add = run_command("git", &["remote", "add", "base", base.url.as_str()], checkout).await?;
        if !add.success() {
            return Ok(add);
        }
        run_command(
            "git",
            &[
                "-c",
                "user.name=cog",
                "-c",
                "user.email=cog@localhost",
                "pull",
                "--no-edit",
                "base",
                base.reference.as_str(),
            ],
            checkout,
        )
        .await
    }
}

fn git_failure(reason: &str, output: &CommandOutput) -> TaskOutcome {
    TaskOutcome::failure(reason)
        .with_field("code", output.code_string())
        .with_field("log", output.combined())
}

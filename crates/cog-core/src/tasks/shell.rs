//! `shell`: run one command in the scratch directory and attach its output.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use super::support::run_command;
use crate::domain::{Attachment, TaskDocument, TaskOutcome};
use crate::typed::{BodyError, Task, TaskBody};

#[derive(Debug, Clone, Deserialize)]
pub struct ShellTask {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Attachment name for the captured output.
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_output() -> String {
    "output.txt".to_string()
}

impl Task for ShellTask {
    const NAME: &'static str = "shell";
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShellBody;

#[async_trait]
impl TaskBody<ShellTask> for ShellBody {
    async fn run(
        &self,
        task: ShellTask,
        _document: &TaskDocument,
        work_dir: &Path,
    ) -> Result<TaskOutcome, BodyError> {
        let args: Vec<&str> = task.args.iter().map(String::as_str).collect();
        let output = run_command(&task.command, &args, work_dir).await?;

        let outcome = TaskOutcome::success()
            .with_field("returncode", output.code)
            .with_attachment(Attachment::text(task.output, output.combined()).with_link_name("Output"));
        if output.success() {
            Ok(outcome)
        } else {
            Ok(outcome.failed_because("command failed"))
        }
    }
}

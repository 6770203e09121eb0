//! `fixme`: list every occurrence of "fixme" in the checked-out tree.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use super::support::{CommandOutput, SourceSpec, run_command};
use crate::domain::{Attachment, TaskDocument, TaskOutcome};
use crate::typed::{BodyError, Task, TaskBody};

#[derive(Debug, Clone, Deserialize)]
pub struct FixmeTask {
    #[serde(flatten)]
    pub source: SourceSpec,
}

impl Task for FixmeTask {
    const NAME: &'static str = "fixme";
}

/// `grep -irn` over `dir`, skipping VCS metadata.
pub(crate) async fn grep_fixmes(dir: &Path) -> Result<CommandOutput, BodyError> {
    run_command(
        "grep",
        &[
            "-irn",
            "--exclude-dir=.git",
            "--exclude-dir=.svn",
            "fixme",
            ".",
        ],
        dir,
    )
    .await
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FixmeBody;

#[async_trait]
impl TaskBody<FixmeTask> for FixmeBody {
    async fn run(
        &self,
        task: FixmeTask,
        _document: &TaskDocument,
        work_dir: &Path,
    ) -> Result<TaskOutcome, BodyError> {
        let source = match task.source.validate() {
            Ok(source) => source,
            Err(reason) => return Ok(TaskOutcome::failure(reason)),
        };
        let checkout = match source.fetch(work_dir).await {
            Ok(path) => path,
            Err(failed) => return Ok(failed),
        };

        let grep = grep_fixmes(&checkout).await?;
        // grep: 0 = matches, 1 = no matches, anything else = trouble
        if !matches!(grep.code, Some(0) | Some(1)) {
            return Ok(TaskOutcome::failure("grep failed")
                .with_field("grep_returncode", grep.code)
                .with_field("log", grep.stderr));
        }

        let count = grep.stdout.lines().count();
        Ok(TaskOutcome::success()
            .with_field("grep_returncode", grep.code)
            .with_field("fixme_count", count)
            .with_attachment(Attachment::text("fixme.txt", grep.stdout).with_link_name("FIXMEs")))
    }
}

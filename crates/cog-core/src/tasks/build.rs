//! `build`: check out a revision (optionally merged with a base ref),
//! configure it and run the build.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::support::{CommandOutput, SourceSpec, run_shell};
use crate::domain::{Attachment, TaskDocument, TaskOutcome};
use crate::typed::{BodyError, Task, TaskBody};

/// Build options decoded from kwargs. Omitted options take the defaults
/// below; nothing is carried between runs.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildTask {
    #[serde(flatten)]
    pub source: SourceSpec,

    /// Run `./configure` before building.
    #[serde(default = "default_configure")]
    pub configure: bool,

    #[serde(default)]
    pub configure_options: Vec<String>,

    #[serde(default = "default_build_command")]
    pub build_command: String,

    #[serde(default = "default_build_options")]
    pub build_options: Vec<String>,
}

fn default_configure() -> bool {
    true
}

fn default_build_command() -> String {
    "scons".to_string()
}

fn default_build_options() -> Vec<String> {
    vec!["-j2".to_string()]
}

impl Task for BuildTask {
    const NAME: &'static str = "build";
}

impl BuildTask {
    /// Build step as a shell snippet. A configure step that leaves an
    /// `env.sh` behind is sourced first.
    fn build_script(&self, checkout: &Path) -> String {
        let command = std::iter::once(self.build_command.as_str())
            .chain(self.build_options.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if checkout.join("env.sh").exists() {
            format!(". ./env.sh && {command}")
        } else {
            command
        }
    }
}

/// `./configure` has to exit cleanly and leave an `env.sh` for the build.
fn configure_succeeded(configure: &CommandOutput, checkout: &Path) -> bool {
    configure.success() && checkout.join("env.sh").exists()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildBody;

#[async_trait]
impl TaskBody<BuildTask> for BuildBody {
    async fn run(
        &self,
        task: BuildTask,
        document: &TaskDocument,
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

        if task.configure {
            let script = std::iter::once("./configure")
                .chain(task.configure_options.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            let configure = run_shell(&script, &checkout).await?;
            if !configure_succeeded(&configure, &checkout) {
                return Ok(TaskOutcome::failure("configure failed")
                    .with_field("configure_returncode", configure.code)
                    .with_attachment(
                        Attachment::text("configure_log.txt", configure.combined())
                            .with_link_name("Configure Log"),
                    ));
            }
        }

        let build = run_shell(&task.build_script(&checkout), &checkout).await?;
        info!(task_id = %document.id, code = ?build.code, "build finished");

        let outcome = TaskOutcome::success()
            .with_field("build_returncode", build.code)
            .with_attachment(
                Attachment::text("build_log.txt", build.combined()).with_link_name("Build Log"),
            );
        if build.success() {
            Ok(outcome)
        } else {
            Ok(outcome.failed_because("build failed"))
        }
    }
}

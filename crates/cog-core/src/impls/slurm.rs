//! Submitter for the cluster's `q` wrapper around SLURM.

use std::ffi::OsString;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::ports::{JobRequest, JobSubmitter, SubmitError};

/// Runs `<program> [-w node] [-p partition] [-so out] [-se err] <command> <args...>`.
#[derive(Debug, Clone)]
pub struct SlurmSubmitter {
    program: String,
}

impl SlurmSubmitter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments passed to the submission tool for `job`.
    pub fn command_line(job: &JobRequest) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::new();
        if let Some(node) = &job.placement.node {
            argv.extend(["-w".into(), node.into()]);
        }
        if let Some(partition) = &job.placement.partition {
            argv.extend(["-p".into(), partition.into()]);
        }
        if let Some(stdout) = &job.outputs.stdout {
            argv.extend(["-so".into(), stdout.into()]);
        }
        if let Some(stderr) = &job.outputs.stderr {
            argv.extend(["-se".into(), stderr.into()]);
        }
        argv.push(job.command.clone().into());
        argv.extend(job.argv().map(OsString::from));
        argv
    }
}

impl Default for SlurmSubmitter {
    fn default() -> Self {
        Self::new("q")
    }
}

#[async_trait]
impl JobSubmitter for SlurmSubmitter {
    async fn submit(&self, job: &JobRequest) -> Result<(), SubmitError> {
        let argv = Self::command_line(job);
        debug!(program = %self.program, ?argv, "submitting job");

        let output = Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SubmitError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };
        Err(SubmitError::Rejected {
            code: output.status.code(),
            message,
        })
    }
}

//! JobSubmitter port - クラスタへのジョブ投入
//!
//! 投入の成功は「クラスタのキューに受理された」ことだけを意味します。
//! ジョブ自体の成否は、後で TaskRunner が `completed` を書くことで分かります。

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Where a job may run. `None` leaves the choice to the cluster scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// Comma-separated partition list.
    pub partition: Option<String>,
    pub node: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputPaths {
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// One job submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub command: String,

    /// Argument string, only ever tokenized on whitespace.
    pub args: String,
    pub placement: Placement,
    pub outputs: OutputPaths,
}

impl JobRequest {
    pub fn new(command: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: args.into(),
            placement: Placement::default(),
            outputs: OutputPaths::default(),
        }
    }

    pub fn argv(&self) -> impl Iterator<Item = &str> {
        self.args.split_whitespace()
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("failed to launch submission tool '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("submission tool exited with {}: {message}", exit_status(.code))]
    Rejected { code: Option<i32>, message: String },
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

impl SubmitError {
    /// Exit code of the submission tool, when it ran and exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            SubmitError::Spawn { .. } => None,
            SubmitError::Rejected { code, .. } => *code,
        }
    }
}

/// JobSubmitter は 1 回の投入を 1 回のツール起動に変換する
///
/// リトライはしない（失敗は呼び出し側がログに残すだけ）。
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, job: &JobRequest) -> Result<(), SubmitError>;
}

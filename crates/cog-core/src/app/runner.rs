//! TaskRunner - 1 つのドキュメントを実行するワーカー側のハーネス
//!
//! # フロー
//! 1. Acquire: ドキュメント取得（失敗は致命的）
//! 2. Start: `started = now`, `node = host` を保存し、再取得
//! 3. Execute: 専用の作業ディレクトリで TaskBody を実行（終了時に必ず削除）
//! 4. Finish: 添付ファイルを先に保存し、その後 `results` と `completed` を保存
//!
//! TaskBody の失敗（Err / success=false / panic）は「結果」として記録します。
//! ストアへの書き込み失敗だけが RunnerError になり、ドキュメントは
//! `started` のまま残ります（クラッシュと区別しない）。

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{StoreError, TaskDocument, TaskId, TaskOutcome};
use crate::ports::{Clock, TaskStore};
use crate::typed::TaskRegistry;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to fetch task {id}: {source}")]
    Acquire {
        id: TaskId,
        #[source]
        source: StoreError,
    },

    #[error("failed to mark task {id} started: {source}")]
    Start {
        id: TaskId,
        #[source]
        source: StoreError,
    },

    #[error("failed to create work directory: {0}")]
    WorkDir(#[source] std::io::Error),

    #[error("failed to store attachment '{filename}' for task {id}: {source}")]
    Attachment {
        id: TaskId,
        filename: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to record results for task {id}: {source}")]
    Finish {
        id: TaskId,
        #[source]
        source: StoreError,
    },
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub id: TaskId,
    pub name: String,
    pub success: bool,
    pub reason: Option<String>,
    pub attachments: Vec<String>,
}

pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    node: String,
    scratch_root: Option<PathBuf>,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            node: node.into(),
            scratch_root: None,
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: Option<PathBuf>) -> Self {
        self.scratch_root = root;
        self
    }

    fn work_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("cog-");
        match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }

    pub async fn run(&self, id: &TaskId) -> Result<TaskReport, RunnerError> {
        // acquire
        let mut doc = self
            .store
            .get(id)
            .await
            .map_err(|source| RunnerError::Acquire {
                id: id.clone(),
                source,
            })?;
        info!(task_id = %id, name = %doc.name, state = %doc.state(), node = %self.node, "starting task");

        // start
        doc.mark_started(self.clock.now(), self.node.clone());
        let start_err = |source: StoreError| RunnerError::Start {
            id: id.clone(),
            source,
        };
        self.store.save(&mut doc).await.map_err(start_err)?;
        let doc = self.store.get(id).await.map_err(start_err)?;

        // execute
        let work_dir = self.work_dir().map_err(RunnerError::WorkDir)?;
        let outcome = self.execute(&doc, work_dir.path()).await;
        let work_path = work_dir.path().to_path_buf();
        if let Err(err) = work_dir.close() {
            warn!(task_id = %id, path = %work_path.display(), error = %err, "failed to remove work directory");
        }

        // finish
        let (results, attachments) = outcome.into_results();
        let finish_err = |source: StoreError| RunnerError::Finish {
            id: id.clone(),
            source,
        };
        let mut rev = doc
            .rev
            .clone()
            .ok_or_else(|| finish_err(StoreError::MissingRevision(id.clone())))?;
        for attachment in &attachments {
            rev = self
                .store
                .put_attachment(id, &rev, attachment)
                .await
                .map_err(|source| RunnerError::Attachment {
                    id: id.clone(),
                    filename: attachment.filename.clone(),
                    source,
                })?;
        }

        // Re-read so the final write carries the attachment revisions.
        let mut doc = self.store.get(id).await.map_err(finish_err)?;
        let report = TaskReport {
            id: id.clone(),
            name: doc.name.clone(),
            success: results.success,
            reason: results.reason.clone(),
            attachments: attachments.iter().map(|a| a.filename.clone()).collect(),
        };
        doc.complete(self.clock.now(), results);
        self.store.save(&mut doc).await.map_err(finish_err)?;

        info!(task_id = %id, success = report.success, reason = report.reason.as_deref().unwrap_or(""), "task completed");
        Ok(report)
    }

    /// Run the body for `doc`. Every failure mode of the body becomes a
    /// failed outcome.
    async fn execute(&self, doc: &TaskDocument, work_dir: &Path) -> TaskOutcome {
        let Some(body) = self.registry.get(&doc.name) else {
            warn!(task_id = %doc.id, name = %doc.name, "no task body registered");
            return TaskOutcome::failure(format!("unknown task '{}'", doc.name));
        };

        let document = doc.clone();
        let dir = work_dir.to_path_buf();
        let handle = tokio::spawn(async move { body.run_dyn(&document, &dir).await });

        match handle.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(task_id = %doc.id, error = %err, "task body failed");
                TaskOutcome::failure(err.to_string())
            }
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                warn!(task_id = %doc.id, panic = %message, "task body panicked");
                TaskOutcome::failure(format!("task body panicked: {message}"))
            }
            Err(join_err) => TaskOutcome::failure(format!("task body did not finish: {join_err}")),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

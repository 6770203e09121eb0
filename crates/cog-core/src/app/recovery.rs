//! Recovery - 止まったタスクを pending に戻すオペレータ用ツール
//!
//! 指定された状態（と作成時刻の下限）に一致するドキュメントから
//! `queued` / `started` / `completed` を取り除き、一括更新で保存します。
//! `results` / `node` / 添付ファイルは前回の試行の記録として残します。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{LifecycleState, StoreError, TaskId};
use crate::ports::{BatchOutcome, TaskStore};

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Documents returned to pending.
    pub reset: Vec<TaskId>,
    /// Documents written concurrently; left as they were.
    pub conflicts: Vec<TaskId>,
    pub failed: Vec<(TaskId, String)>,
}

/// A store failure partway through a run. `report` lists what was already
/// committed before the failure.
#[derive(Debug, Error)]
#[error("recovery stopped after resetting {} tasks: {source}", .report.reset.len())]
pub struct RecoveryError {
    pub report: RecoveryReport,
    #[source]
    pub source: StoreError,
}

pub struct Recovery {
    store: Arc<dyn TaskStore>,
    batch_size: usize,
}

impl Recovery {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Upper bound on documents per bulk write (at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Reset every document in `state` created at or after `min_created`.
    ///
    /// Running it twice on the same scope resets nothing the second time.
    /// Only store connectivity problems are errors; per-document conflicts and
    /// failures are reported. An error still carries the partial report.
    pub async fn requeue(
        &self,
        state: LifecycleState,
        min_created: Option<DateTime<Utc>>,
    ) -> Result<RecoveryReport, RecoveryError> {
        let mut report = RecoveryReport::default();
        match self.requeue_into(&mut report, state, min_created).await {
            Ok(()) => {
                info!(
                    reset = report.reset.len(),
                    conflicts = report.conflicts.len(),
                    failed = report.failed.len(),
                    "recovery finished"
                );
                Ok(report)
            }
            Err(source) => {
                warn!(reset = report.reset.len(), error = %source, "recovery aborted");
                Err(RecoveryError { report, source })
            }
        }
    }

    async fn requeue_into(
        &self,
        report: &mut RecoveryReport,
        state: LifecycleState,
        min_created: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let ids = self.store.find_by_state_and_age(state, min_created).await?;
        info!(%state, count = ids.len(), "found tasks to reset");

        for chunk in ids.chunks(self.batch_size) {
            let mut batch = Vec::with_capacity(chunk.len());
            for id in chunk {
                match self.store.get(id).await {
                    Ok(mut doc) => {
                        if doc.reset() {
                            batch.push(doc);
                        }
                    }
                    Err(err) if err.is_not_found() => {
                        debug!(task_id = %id, "task vanished before reset");
                    }
                    Err(err) => return Err(err),
                }
            }
            if batch.is_empty() {
                continue;
            }

            for result in self.store.batch_update(batch).await? {
                match result.outcome {
                    BatchOutcome::Saved(_) => report.reset.push(result.id),
                    BatchOutcome::Conflict => {
                        warn!(task_id = %result.id, "task changed during reset; skipped");
                        report.conflicts.push(result.id);
                    }
                    BatchOutcome::Failed(reason) => {
                        warn!(task_id = %result.id, %reason, "task reset failed");
                        report.failed.push((result.id, reason));
                    }
                }
            }
        }
        Ok(())
    }
}

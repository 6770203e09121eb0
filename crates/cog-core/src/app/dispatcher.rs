//! Dispatcher - pending タスクをクラスタへ投入するループ
//!
//! # フロー（1 件ずつ逐次処理）
//! 1. pending フィードから task_id を取得
//! 2. ドキュメントを再取得（pending でなければ skip）
//! 3. requires から partition を解決
//! 4. worker のコマンドラインを組み立て
//! 5. `queued = now` を保存（投入より先に印を付ける）
//! 6. JobSubmitter で投入（失敗はログのみ、リトライしない）
//!
//! 同時に動く dispatcher は 1 つだけという前提です（運用上の不変条件）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ClusterConfig, StoreConfig};
use crate::domain::{
    ErrorKind, LifecycleState, StoreError, TaskDocument, TaskId, resolve_partition,
};
use crate::impls::ReconnectPolicy;
use crate::ports::{Clock, JobRequest, JobSubmitter, OutputPaths, Placement, TaskStore};

/// How a submitted job starts a worker for one document.
///
/// The resulting command line carries everything a fresh worker process needs
/// to reach the store and fetch the document:
/// `<program> run --store-url <url> --database <db> [--username <u>]
/// [--password <p>] <task-name> <doc-id>`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: String,
    store: StoreConfig,
    log_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, store: StoreConfig) -> Self {
        Self {
            program: program.into(),
            store,
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, log_dir: Option<PathBuf>) -> Self {
        self.log_dir = log_dir;
        self
    }

    /// Reason why `doc` cannot be expressed on a whitespace-split command line.
    fn unsubmittable(doc: &TaskDocument) -> Option<&'static str> {
        if doc.name.is_empty() {
            Some("document has no task name")
        } else if doc.name.contains(char::is_whitespace) {
            Some("task name contains whitespace")
        } else if doc.id.as_str().contains(char::is_whitespace) {
            Some("document id contains whitespace")
        } else {
            None
        }
    }

    pub fn job_for(&self, doc: &TaskDocument, placement: Placement) -> JobRequest {
        let mut args = vec![
            "run".to_string(),
            "--store-url".to_string(),
            self.store.url.clone(),
            "--database".to_string(),
            self.store.database.clone(),
        ];
        if let Some(username) = &self.store.username {
            args.extend(["--username".to_string(), username.clone()]);
        }
        if let Some(password) = &self.store.password {
            args.extend(["--password".to_string(), password.clone()]);
        }
        args.extend([doc.name.clone(), doc.id.to_string()]);

        let outputs = match &self.log_dir {
            Some(dir) => OutputPaths {
                stdout: Some(dir.join(format!("{}.out", doc.id))),
                stderr: Some(dir.join(format!("{}.err", doc.id))),
            },
            None => OutputPaths::default(),
        };

        JobRequest {
            command: self.program.clone(),
            args: args.join(" "),
            placement,
            outputs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The document disappeared between the feed and the fetch.
    Missing,
    NotPending(LifecycleState),
    /// Someone else wrote the document while it was being marked.
    Conflict,
    Unsubmittable(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Submitted { partition: Option<String> },
    Skipped(SkipReason),
    /// The document is marked `queued` but no job exists for it.
    SubmitFailed { code: Option<i32>, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: usize,
    pub skipped: usize,
    pub submit_failed: usize,
    pub errors: usize,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    submitter: Arc<dyn JobSubmitter>,
    clock: Arc<dyn Clock>,
    cluster: ClusterConfig,
    node: Option<String>,
    worker: WorkerCommand,
    retry: ReconnectPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        submitter: Arc<dyn JobSubmitter>,
        clock: Arc<dyn Clock>,
        cluster: ClusterConfig,
        worker: WorkerCommand,
    ) -> Self {
        Self {
            store,
            submitter,
            clock,
            cluster,
            node: None,
            worker,
            retry: ReconnectPolicy::default(),
        }
    }

    /// Backoff before a candidate is retried after the store was unreachable.
    pub fn with_retry_policy(mut self, retry: ReconnectPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pin every job to `node`.
    pub fn with_node(mut self, node: Option<String>) -> Self {
        self.node = node;
        self
    }

    /// Handle one candidate from the feed.
    ///
    /// Store errors other than "gone" and "conflict" are returned; the
    /// candidate is then left as it was (pending, or queued if the failure
    /// happened after the mark).
    pub async fn dispatch_one(&self, id: &TaskId) -> Result<DispatchOutcome, StoreError> {
        let mut doc = match self.store.get(id).await {
            Ok(doc) => doc,
            Err(err) if err.is_not_found() => {
                return Ok(DispatchOutcome::Skipped(SkipReason::Missing));
            }
            Err(err) => return Err(err),
        };

        let state = doc.state();
        if !state.is_dispatchable() {
            return Ok(DispatchOutcome::Skipped(SkipReason::NotPending(state)));
        }
        if let Some(reason) = WorkerCommand::unsubmittable(&doc) {
            return Ok(DispatchOutcome::Skipped(SkipReason::Unsubmittable(reason)));
        }

        let partition = resolve_partition(
            &doc.requires,
            &self.cluster.partition_map,
            self.cluster.default_partition.as_deref(),
        );
        let job = self.worker.job_for(
            &doc,
            Placement {
                partition: partition.clone(),
                node: self.node.clone(),
            },
        );

        // Mark before submitting: a crash between the two leaves an inert
        // queued document for recovery, never a second submission.
        if doc.mark_queued(self.clock.now()).is_err() {
            return Ok(DispatchOutcome::Skipped(SkipReason::NotPending(doc.state())));
        }
        match self.store.save(&mut doc).await {
            Ok(_) => {}
            Err(err) if err.is_conflict() => {
                return Ok(DispatchOutcome::Skipped(SkipReason::Conflict));
            }
            Err(err) => return Err(err),
        }

        match self.submitter.submit(&job).await {
            Ok(()) => Ok(DispatchOutcome::Submitted { partition }),
            Err(err) => Ok(DispatchOutcome::SubmitFailed {
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }

    /// Poll the pending feed until `stop` fires.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> DispatchStats {
        let mut wait = stop.clone();
        let mut feed = self.store.pending(stop);
        let mut stats = DispatchStats::default();
        // The feed has already moved past a candidate that hit an unreachable
        // store, so it is held here and retried until it is decided.
        let mut held: Option<TaskId> = None;
        let mut failures: u32 = 0;
        info!("dispatcher polling for pending tasks");

        loop {
            let id = match held.take() {
                Some(id) => id,
                None => match feed.next_id().await {
                    Ok(Some(id)) => id,
                    Ok(None) => break,
                    Err(err) => {
                        stats.errors += 1;
                        warn!(error = %err, "pending feed failed");
                        continue;
                    }
                },
            };

            match self.dispatch_one(&id).await {
                Ok(DispatchOutcome::Submitted { partition }) => {
                    stats.submitted += 1;
                    info!(task_id = %id, partition = partition.as_deref().unwrap_or("-"), "task submitted");
                }
                Ok(DispatchOutcome::Skipped(reason)) => {
                    stats.skipped += 1;
                    match reason {
                        SkipReason::Unsubmittable(why) => {
                            warn!(task_id = %id, reason = why, "task cannot be submitted");
                        }
                        other => debug!(task_id = %id, reason = ?other, "task skipped"),
                    }
                }
                Ok(DispatchOutcome::SubmitFailed { code, message }) => {
                    stats.submit_failed += 1;
                    error!(task_id = %id, ?code, %message, "submission failed; task left queued");
                }
                Err(err) if err.kind() == ErrorKind::Infrastructure => {
                    stats.errors += 1;
                    failures = failures.saturating_add(1);
                    let delay = self.retry.next_delay(failures);
                    warn!(
                        task_id = %id,
                        error = %err,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "store unavailable, retrying task"
                    );
                    if !sleep_unless_stopped(&mut wait, delay).await {
                        break;
                    }
                    held = Some(id);
                    continue;
                }
                Err(err) => {
                    stats.errors += 1;
                    error!(task_id = %id, error = %err, "dispatch failed");
                }
            }
            failures = 0;
        }

        info!(
            submitted = stats.submitted,
            skipped = stats.skipped,
            submit_failed = stats.submit_failed,
            errors = stats.errors,
            "dispatcher stopped"
        );
        stats
    }
}

/// Sleep for `delay`; `false` when `stop` fired (or was dropped) first.
async fn sleep_unless_stopped(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *stop.borrow() {
        return false;
    }
    let changed = tokio::select! {
        _ = tokio::time::sleep(delay) => return true,
        changed = stop.changed() => changed,
    };
    changed.is_ok() && !*stop.borrow()
}

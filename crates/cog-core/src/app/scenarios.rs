//! End-to-end lifecycle scenarios against the in-memory store, plus the
//! shared fixtures the app tests use.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::{Attachment, TaskDocument, TaskOutcome};
use crate::ports::{FixedClock, JobRequest, JobSubmitter, SubmitError};
use crate::typed::{BodyError, Task, TaskBody, TaskRegistry};

/// Records every job instead of submitting it.
#[derive(Default)]
pub(crate) struct RecordingSubmitter {
    jobs: Mutex<Vec<JobRequest>>,
    reject: Option<(i32, String)>,
}

impl RecordingSubmitter {
    /// Records the job, then fails like a submission tool exiting with `code`.
    pub(crate) fn rejecting(code: i32, message: &str) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            reject: Some((code, message.to_string())),
        }
    }

    pub(crate) fn jobs(&self) -> Vec<JobRequest> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobSubmitter for RecordingSubmitter {
    async fn submit(&self, job: &JobRequest) -> Result<(), SubmitError> {
        self.jobs.lock().unwrap().push(job.clone());
        match &self.reject {
            Some((code, message)) => Err(SubmitError::Rejected {
                code: Some(*code),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

pub(crate) fn epoch(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

pub(crate) fn fixed_clock() -> FixedClock {
    FixedClock::new(epoch(1_700_000_000))
}

/// Test body: attaches `log.txt`, or fails / panics on request.
#[derive(Debug, Deserialize)]
pub(crate) struct EmitLog {
    #[serde(default = "default_log")]
    log: String,
    #[serde(default)]
    fail: Option<String>,
    #[serde(default)]
    panic: bool,
    #[serde(default)]
    touch: Option<String>,
}

fn default_log() -> String {
    "ok".to_string()
}

impl Task for EmitLog {
    const NAME: &'static str = "emit-log";
}

pub(crate) struct EmitLogBody;

#[async_trait]
impl TaskBody<EmitLog> for EmitLogBody {
    async fn run(
        &self,
        task: EmitLog,
        _document: &TaskDocument,
        work_dir: &Path,
    ) -> Result<TaskOutcome, BodyError> {
        if task.panic {
            panic!("boom");
        }
        if let Some(reason) = task.fail {
            return Err(BodyError::Failed(reason));
        }
        if let Some(name) = task.touch {
            std::fs::write(work_dir.join(name), b"x")
                .map_err(|e| BodyError::io("write marker", e))?;
        }
        Ok(TaskOutcome::success()
            .with_field("work_dir", work_dir.display().to_string())
            .with_attachment(Attachment::text("log.txt", task.log).with_link_name("Log")))
    }
}

pub(crate) fn registry_with_emit_log() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry.register::<EmitLog, _>(EmitLogBody).unwrap();
    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::watch;

    use crate::app::{
        DispatchOutcome, Dispatcher, Recovery, RunnerError, TaskRunner, WorkerCommand,
    };
    use crate::config::{ClusterConfig, StoreConfig};
    use crate::domain::{LifecycleState, StoreError, TaskId};
    use crate::impls::{InMemoryTaskStore, ReconnectPolicy};
    use crate::ports::{Clock, TaskStore};

    struct Harness {
        store: InMemoryTaskStore,
        submitter: Arc<RecordingSubmitter>,
        scratch: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: InMemoryTaskStore::new(),
                submitter: Arc::new(RecordingSubmitter::default()),
                scratch: tempfile::tempdir().unwrap(),
            }
        }

        fn dispatcher(&self) -> Dispatcher {
            Dispatcher::new(
                Arc::new(self.store.clone()),
                self.submitter.clone(),
                Arc::new(fixed_clock()),
                ClusterConfig::default(),
                WorkerCommand::new("cog", StoreConfig::new("http://couch:5984", "ci")),
            )
        }

        fn runner(&self, node: &str) -> TaskRunner {
            TaskRunner::new(
                Arc::new(self.store.clone()),
                registry_with_emit_log(),
                Arc::new(fixed_clock()),
                node,
            )
            .with_scratch_root(Some(self.scratch.path().to_path_buf()))
        }

        fn recovery(&self) -> Recovery {
            Recovery::new(Arc::new(self.store.clone()))
        }

        /// Drain whatever a fresh feed yields right now.
        async fn pending_now(&self) -> Vec<TaskId> {
            let (_stop_tx, stop_rx) = watch::channel(false);
            let mut feed = self.store.pending(stop_rx);
            let mut ids = Vec::new();
            while let Ok(Ok(Some(id))) =
                tokio::time::timeout(Duration::from_millis(50), feed.next_id()).await
            {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            ids
        }
    }

    #[tokio::test]
    async fn end_to_end_dispatch_run_complete() {
        let h = Harness::new();
        h.store
            .insert(TaskDocument::new("t1", EmitLog::NAME).requiring(Vec::<String>::new()))
            .await;
        let id = TaskId::new("t1");

        let outcome = h.dispatcher().dispatch_one(&id).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Submitted { partition: None });
        let jobs = h.submitter.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].placement.partition, None);
        assert!(jobs[0].args.ends_with("emit-log t1"));

        h.runner("node07").run(&id).await.unwrap();

        let doc = h.store.get(&id).await.unwrap();
        assert!(doc.completed.is_some());
        assert!(doc.started.is_some());
        let results = doc.results.unwrap();
        assert!(results.success);
        let log = h.store.get_attachment(&id, "log.txt").await.unwrap();
        assert_eq!(log.data, b"ok".to_vec());
    }

    #[tokio::test]
    async fn dispatcher_loop_submits_each_pending_task_once() {
        let h = Harness::new();
        h.store.insert(TaskDocument::new("a", EmitLog::NAME)).await;
        let mut done = TaskDocument::new("done", EmitLog::NAME);
        done.mark_queued(epoch(1)).unwrap();
        h.store.insert(done).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = h.dispatcher();
        let store = h.store.clone();
        let submitter = h.submitter.clone();

        let driver = async move {
            store.insert(TaskDocument::new("b", EmitLog::NAME)).await;
            for _ in 0..200 {
                if submitter.jobs().len() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            stop_tx.send(true).unwrap();
        };
        let (stats, ()) = tokio::join!(dispatcher.run(stop_rx), driver);

        assert_eq!(stats.submitted, 2);
        let mut submitted: Vec<String> = h
            .submitter
            .jobs()
            .iter()
            .map(|job| job.args.split_whitespace().last().unwrap().to_string())
            .collect();
        submitted.sort();
        assert_eq!(submitted, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unreachable_store_does_not_lose_the_candidate() {
        let h = Harness::new();
        h.store.insert(TaskDocument::new("t1", EmitLog::NAME)).await;
        h.store.fail_next_gets(1).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = h.dispatcher().with_retry_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(20),
        });
        let submitter = h.submitter.clone();
        let driver = async move {
            for _ in 0..200 {
                if !submitter.jobs().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            stop_tx.send(true).unwrap();
        };
        let (stats, ()) = tokio::join!(dispatcher.run(stop_rx), driver);

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.submitted, 1);
        assert_eq!(h.submitter.jobs().len(), 1);
        let doc = h.store.get(&TaskId::new("t1")).await.unwrap();
        assert_eq!(doc.state(), LifecycleState::Queued);
    }

    #[tokio::test]
    async fn pending_feed_safety_and_liveness() {
        let h = Harness::new();
        h.store.insert(TaskDocument::new("p1", EmitLog::NAME)).await;
        h.store.insert(TaskDocument::new("p2", EmitLog::NAME)).await;

        assert_eq!(h.pending_now().await, vec![TaskId::new("p1"), TaskId::new("p2")]);

        h.dispatcher().dispatch_one(&TaskId::new("p1")).await.unwrap();
        assert_eq!(h.pending_now().await, vec![TaskId::new("p2")]);
    }

    #[tokio::test]
    async fn concurrent_queued_marks_have_one_winner() {
        let h = Harness::new();
        h.store.insert(TaskDocument::new("t1", EmitLog::NAME)).await;
        let id = TaskId::new("t1");

        let mut first = h.store.get(&id).await.unwrap();
        let mut second = first.clone();
        first.mark_queued(fixed_clock().now()).unwrap();
        second.mark_queued(fixed_clock().now()).unwrap();

        let (a, b) = tokio::join!(h.store.save(&mut first), h.store.save(&mut second));
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(StoreError::Conflict(_))))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn racing_dispatches_submit_once() {
        let h = Harness::new();
        h.store.insert(TaskDocument::new("t1", EmitLog::NAME)).await;
        let id = TaskId::new("t1");
        let (d1, d2) = (h.dispatcher(), h.dispatcher());

        let (a, b) = tokio::join!(d1.dispatch_one(&id), d2.dispatch_one(&id));
        let submitted = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(|o| matches!(o, DispatchOutcome::Submitted { .. }))
            .count();

        assert_eq!(submitted, 1);
        assert_eq!(h.submitter.jobs().len(), 1);
    }

    #[tokio::test]
    async fn failed_results_write_leaves_task_started_with_attachments_only() {
        let h = Harness::new();
        h.store.insert(TaskDocument::new("t1", EmitLog::NAME)).await;
        let id = TaskId::new("t1");
        h.dispatcher().dispatch_one(&id).await.unwrap();

        // the start mark goes through, the results write does not
        h.store.fail_saves_after(1).await;
        let err = h.runner("node07").run(&id).await.unwrap_err();
        assert!(matches!(err, RunnerError::Finish { .. }));

        let doc = h.store.get(&id).await.unwrap();
        assert_eq!(doc.state(), LifecycleState::Started);
        assert!(doc.results.is_none());
        assert_eq!(h.store.attachment_names(&id).await, vec!["log.txt"]);
    }

    #[tokio::test]
    async fn failed_attachment_write_never_publishes_results() {
        let h = Harness::new();
        h.store.insert(TaskDocument::new("t1", EmitLog::NAME)).await;
        let id = TaskId::new("t1");
        h.dispatcher().dispatch_one(&id).await.unwrap();

        h.store.fail_attachment_writes().await;
        let err = h.runner("node07").run(&id).await.unwrap_err();
        assert!(matches!(err, RunnerError::Attachment { ref filename, .. } if filename == "log.txt"));

        let doc = h.store.get(&id).await.unwrap();
        assert_eq!(doc.state(), LifecycleState::Started);
        assert!(doc.results.is_none());
    }

    #[tokio::test]
    async fn published_results_only_link_stored_attachments() {
        let h = Harness::new();
        h.store
            .insert(TaskDocument::new("t1", EmitLog::NAME).with_kwarg("log", "built"))
            .await;
        let id = TaskId::new("t1");
        h.dispatcher().dispatch_one(&id).await.unwrap();
        h.runner("node07").run(&id).await.unwrap();

        let results = h.store.get(&id).await.unwrap().results.unwrap();
        assert_eq!(results.attach_links.len(), 1);
        for link in &results.attach_links {
            h.store.get_attachment(&id, &link.id).await.unwrap();
        }
        let stored = serde_json::to_value(&results).unwrap();
        assert!(stored.get("attachments").is_none());
    }

    #[tokio::test]
    async fn crashed_task_is_recovered_and_redispatched() {
        let h = Harness::new();
        let mut earlier = TaskDocument::new("t1", EmitLog::NAME).with_kwarg("fail", "flaky");
        earlier.mark_queued(epoch(1)).unwrap();
        earlier.mark_started(epoch(2), "node-old");
        let (failed, _) = TaskOutcome::failure("flaky").into_results();
        earlier.complete(epoch(3), failed);
        h.store.insert(earlier).await;
        let id = TaskId::new("t1");

        // first recovery: completed -> pending, then the task crashes on node-a
        h.recovery().requeue(LifecycleState::Completed, None).await.unwrap();
        let mut doc = h.store.get(&id).await.unwrap();
        doc.kwargs.remove("fail");
        h.store.save(&mut doc).await.unwrap();
        h.dispatcher().dispatch_one(&id).await.unwrap();
        let mut doc = h.store.get(&id).await.unwrap();
        doc.mark_started(fixed_clock().now(), "node-a");
        h.store.save(&mut doc).await.unwrap();
        assert!(h.pending_now().await.is_empty());

        let report = h.recovery().requeue(LifecycleState::Started, None).await.unwrap();
        assert_eq!(report.reset, vec![id.clone()]);
        assert_eq!(h.pending_now().await, vec![id.clone()]);

        let outcome = h.dispatcher().dispatch_one(&id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Submitted { .. }));
        h.runner("node-b").run(&id).await.unwrap();

        let doc = h.store.get(&id).await.unwrap();
        assert_eq!(doc.state(), LifecycleState::Completed);
        assert_eq!(doc.node.as_deref(), Some("node-b"));
        let results = doc.results.unwrap();
        assert!(results.success);
        assert_eq!(results.reason, None);
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let h = Harness::new();
        for id in ["a", "b", "c"] {
            let mut doc = TaskDocument::new(id, EmitLog::NAME).created_at(epoch(10));
            doc.mark_queued(epoch(11)).unwrap();
            doc.mark_started(epoch(12), "node01");
            h.store.insert(doc).await;
        }

        let first = h.recovery().requeue(LifecycleState::Started, None).await.unwrap();
        let second = h.recovery().requeue(LifecycleState::Started, None).await.unwrap();

        assert_eq!(
            first.reset,
            vec![TaskId::new("a"), TaskId::new("b"), TaskId::new("c")]
        );
        assert!(second.reset.is_empty());
        assert!(second.conflicts.is_empty());
    }

    #[tokio::test]
    async fn orphaned_queued_task_is_recoverable() {
        let h = Harness::new();
        h.store.insert(TaskDocument::new("t1", EmitLog::NAME)).await;
        let id = TaskId::new("t1");
        let rejecting = Dispatcher::new(
            Arc::new(h.store.clone()),
            Arc::new(RecordingSubmitter::rejecting(2, "no such partition")),
            Arc::new(fixed_clock()),
            ClusterConfig::default(),
            WorkerCommand::new("cog", StoreConfig::new("http://couch:5984", "ci")),
        );

        let outcome = rejecting.dispatch_one(&id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::SubmitFailed { .. }));

        let report = h.recovery().requeue(LifecycleState::Queued, None).await.unwrap();
        assert_eq!(report.reset, vec![id.clone()]);
        assert_eq!(
            h.dispatcher().dispatch_one(&id).await.unwrap(),
            DispatchOutcome::Submitted { partition: None }
        );
    }
}

//! In-memory task store.
//!
//! Behaves like the document store as far as the core can tell: revisions are
//! checked on every write, every write appends to a change log, and the
//! pending feed follows that log. Used by tests and for local dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, watch};

use crate::domain::{Attachment, LifecycleState, Revision, StoreError, TaskDocument, TaskId};
use crate::ports::{BatchOutcome, BatchResult, PendingFeed, StoredAttachment, TaskStore};

struct StoredDoc {
    doc: TaskDocument,
    generation: u64,
    attachments: BTreeMap<String, StoredAttachment>,
}

impl StoredDoc {
    fn bump(&mut self) -> Revision {
        self.generation += 1;
        let rev = Revision::new(format!("{}-mem", self.generation));
        self.doc.rev = Some(rev.clone());
        rev
    }
}

#[derive(Default)]
struct Faults {
    /// Number of `save` calls that still succeed; `None` = unlimited.
    saves_left: Option<usize>,
    attachments: bool,

    /// Number of upcoming `get` calls that fail as if the store were down.
    gets_to_fail: usize,

    /// Number of `batch_update` calls that still succeed; `None` = unlimited.
    batches_left: Option<usize>,
}

#[derive(Default)]
struct State {
    docs: HashMap<TaskId, StoredDoc>,

    /// Ids in write order. A document appears once per write.
    changes: Vec<TaskId>,
    faults: Faults,
}

impl State {
    fn write(&mut self, doc: &TaskDocument) -> Result<Revision, StoreError> {
        let rev = match (self.docs.get_mut(&doc.id), &doc.rev) {
            (None, None) => {
                let mut stored = StoredDoc {
                    doc: doc.clone(),
                    generation: 0,
                    attachments: BTreeMap::new(),
                };
                let rev = stored.bump();
                self.docs.insert(doc.id.clone(), stored);
                rev
            }
            (Some(stored), Some(rev)) if stored.doc.rev.as_ref() == Some(rev) => {
                stored.doc = doc.clone();
                stored.bump()
            }
            _ => return Err(StoreError::Conflict(doc.id.clone())),
        };
        self.changes.push(doc.id.clone());
        Ok(rev)
    }
}

/// `TaskStore` backed by a map behind a `tokio::sync::Mutex`.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a document regardless of its revision.
    pub async fn insert(&self, mut doc: TaskDocument) -> Revision {
        let mut state = self.state.lock().await;
        let generation = state.docs.get(&doc.id).map_or(0, |d| d.generation);
        let attachments = state
            .docs
            .remove(&doc.id)
            .map(|d| d.attachments)
            .unwrap_or_default();
        doc.rev = None;
        let mut stored = StoredDoc {
            doc,
            generation,
            attachments,
        };
        let rev = stored.bump();
        let id = stored.doc.id.clone();
        state.docs.insert(id.clone(), stored);
        state.changes.push(id);
        drop(state);
        self.notify.notify_waiters();
        rev
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
impl InMemoryTaskStore {
    /// Let `n` more `save` calls succeed, then fail every later one.
    pub async fn fail_saves_after(&self, n: usize) {
        self.state.lock().await.faults.saves_left = Some(n);
    }

    pub async fn fail_next_gets(&self, n: usize) {
        self.state.lock().await.faults.gets_to_fail = n;
    }

    /// Let `n` more `batch_update` calls succeed, then fail every later one.
    pub async fn fail_batches_after(&self, n: usize) {
        self.state.lock().await.faults.batches_left = Some(n);
    }

    pub async fn fail_attachment_writes(&self) {
        self.state.lock().await.faults.attachments = true;
    }

    pub async fn attachment_names(&self, id: &TaskId) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .docs
            .get(id)
            .map(|d| d.attachments.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, id: &TaskId) -> Result<TaskDocument, StoreError> {
        let mut state = self.state.lock().await;
        if state.faults.gets_to_fail > 0 {
            state.faults.gets_to_fail -= 1;
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        state
            .docs
            .get(id)
            .map(|d| d.doc.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn save(&self, doc: &mut TaskDocument) -> Result<Revision, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(left) = state.faults.saves_left.as_mut() {
            if *left == 0 {
                return Err(StoreError::Unavailable("injected save failure".to_string()));
            }
            *left -= 1;
        }
        let rev = state.write(doc)?;
        drop(state);
        doc.rev = Some(rev.clone());
        self.notify.notify_waiters();
        Ok(rev)
    }

    async fn put_attachment(
        &self,
        id: &TaskId,
        rev: &Revision,
        attachment: &Attachment,
    ) -> Result<Revision, StoreError> {
        let mut state = self.state.lock().await;
        if state.faults.attachments {
            return Err(StoreError::Unavailable(
                "injected attachment failure".to_string(),
            ));
        }
        let stored = state
            .docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if stored.doc.rev.as_ref() != Some(rev) {
            return Err(StoreError::Conflict(id.clone()));
        }
        stored.attachments.insert(
            attachment.filename.clone(),
            StoredAttachment {
                content_type: attachment.content_type.clone(),
                data: attachment.contents.clone(),
            },
        );
        let new_rev = stored.bump();
        state.changes.push(id.clone());
        drop(state);
        self.notify.notify_waiters();
        Ok(new_rev)
    }

    async fn get_attachment(
        &self,
        id: &TaskId,
        filename: &str,
    ) -> Result<StoredAttachment, StoreError> {
        let state = self.state.lock().await;
        let stored = state
            .docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        stored
            .attachments
            .get(filename)
            .cloned()
            .ok_or_else(|| StoreError::AttachmentNotFound {
                id: id.clone(),
                filename: filename.to_string(),
            })
    }

    async fn batch_update(
        &self,
        docs: Vec<TaskDocument>,
    ) -> Result<Vec<BatchResult>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(left) = state.faults.batches_left.as_mut() {
            if *left == 0 {
                return Err(StoreError::Unavailable("injected bulk write failure".to_string()));
            }
            *left -= 1;
        }
        let results = docs
            .iter()
            .map(|doc| {
                let outcome = match state.write(doc) {
                    Ok(rev) => BatchOutcome::Saved(rev),
                    Err(StoreError::Conflict(_)) => BatchOutcome::Conflict,
                    Err(other) => BatchOutcome::Failed(other.to_string()),
                };
                BatchResult {
                    id: doc.id.clone(),
                    outcome,
                }
            })
            .collect();
        drop(state);
        self.notify.notify_waiters();
        Ok(results)
    }

    async fn find_by_state_and_age(
        &self,
        lifecycle: LifecycleState,
        min_created: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let state = self.state.lock().await;
        let mut matches: Vec<_> = state
            .docs
            .values()
            .map(|d| &d.doc)
            .filter(|doc| doc.state() == lifecycle)
            .filter(|doc| match min_created {
                Some(min) => doc.created.is_some_and(|created| created >= min),
                None => true,
            })
            .map(|doc| (doc.created, doc.id.clone()))
            .collect();
        matches.sort();
        Ok(matches.into_iter().map(|(_, id)| id).collect())
    }

    fn pending(&self, stop: watch::Receiver<bool>) -> Box<dyn PendingFeed> {
        Box::new(MemoryFeed {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            cursor: 0,
            stop,
        })
    }
}

/// Follows the change log from the beginning, yielding ids that are pending
/// at the moment they are read.
struct MemoryFeed {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    cursor: usize,
    stop: watch::Receiver<bool>,
}

#[async_trait]
impl PendingFeed for MemoryFeed {
    async fn next_id(&mut self) -> Result<Option<TaskId>, StoreError> {
        loop {
            let stopped = *self.stop.borrow();
            if stopped {
                return Ok(None);
            }

            // Register interest before scanning so a write between the scan
            // and the wait is not missed.
            let notify = Arc::clone(&self.notify);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                while self.cursor < state.changes.len() {
                    let id = &state.changes[self.cursor];
                    self.cursor += 1;
                    if state.docs.get(id).is_some_and(|d| d.doc.is_pending()) {
                        return Ok(Some(id.clone()));
                    }
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

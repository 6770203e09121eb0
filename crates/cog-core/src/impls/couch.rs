//! CouchDB-backed task store.
//!
//! Uses the plain HTTP API:
//! - `GET/PUT /{db}/{id}` for single documents (409 = stale revision)
//! - `PUT /{db}/{id}/{file}?rev=` for attachments
//! - `POST /{db}/_bulk_docs` for recovery batches
//! - `POST /{db}/_find` (Mango selector, bookmark paging) for index queries
//! - `POST /{db}/_changes?feed=longpoll&filter=_selector` for the pending feed

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::retry::ReconnectPolicy;
use crate::config::StoreConfig;
use crate::domain::{
    Attachment, LifecycleState, Revision, StoreError, TaskDocument, TaskId, epoch_seconds,
};
use crate::ports::{BatchOutcome, BatchResult, PendingFeed, StoredAttachment, TaskStore};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra time on top of the long-poll timeout before the HTTP request is abandoned.
const LONGPOLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct CouchStore {
    client: Client,
    base: Url,
    database: String,
    credentials: Option<(String, Option<String>)>,
    changes_timeout: Duration,
    page_size: usize,
    reconnect: ReconnectPolicy,
}

impl std::fmt::Debug for CouchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchStore")
            .field("base", &self.base.as_str())
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct WriteResponse {
    rev: Revision,
}

#[derive(Deserialize)]
struct BulkRow {
    id: TaskId,
    #[serde(default)]
    rev: Option<Revision>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct FindResponse {
    docs: Vec<FindRow>,
    #[serde(default)]
    bookmark: Option<String>,
}

#[derive(Deserialize)]
struct FindRow {
    #[serde(rename = "_id")]
    id: TaskId,
    #[serde(default)]
    created: Option<f64>,
}

#[derive(Deserialize)]
struct ChangesResponse {
    results: Vec<ChangeRow>,
    last_seq: Value,
}

#[derive(Deserialize)]
struct ChangeRow {
    id: TaskId,
    #[serde(default)]
    deleted: bool,
}

struct ChangesPage {
    ids: Vec<TaskId>,
    last_seq: Value,
}

impl CouchStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let base = Url::parse(&config.url)
            .map_err(|e| StoreError::InvalidUrl(format!("{}: {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(config.url.clone()));
        }
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        let credentials = config
            .username
            .clone()
            .map(|user| (user, config.password.clone()));

        Ok(Self {
            client,
            base,
            database: config.database.clone(),
            credentials,
            changes_timeout: config.changes_timeout(),
            page_size: config.page_size.max(1),
            reconnect: config.reconnect.policy(),
        })
    }

    /// `<base>/<database>/<segments...>`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| StoreError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push(&self.database)
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, password.as_ref()),
            None => builder,
        }
    }

    async fn poll_changes(&self, since: &Value) -> Result<ChangesPage, StoreError> {
        let mut url = self.url(&["_changes"])?;
        url.query_pairs_mut()
            .append_pair("feed", "longpoll")
            .append_pair("filter", "_selector")
            .append_pair("since", &since_param(since))
            .append_pair("timeout", &self.changes_timeout.as_millis().to_string());

        let response = self
            .request(Method::POST, url)
            .timeout(self.changes_timeout + LONGPOLL_GRACE)
            .json(&json!({ "selector": state_selector(LifecycleState::Pending, None) }))
            .send()
            .await?;
        let changes: ChangesResponse = decode(checked(response, None).await?).await?;
        Ok(ChangesPage::from(changes))
    }
}

impl From<ChangesResponse> for ChangesPage {
    fn from(changes: ChangesResponse) -> Self {
        Self {
            ids: changes
                .results
                .into_iter()
                .filter(|row| !row.deleted)
                .map(|row| row.id)
                .collect(),
            last_seq: changes.last_seq,
        }
    }
}

/// Map a non-success response to a `StoreError`.
async fn checked(response: Response, id: Option<&TaskId>) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(match (status, id) {
        (StatusCode::NOT_FOUND, Some(id)) => StoreError::NotFound(id.clone()),
        (StatusCode::CONFLICT, Some(id)) => StoreError::Conflict(id.clone()),
        _ if status.is_server_error() => {
            StoreError::Unavailable(format!("status {status}: {message}"))
        }
        _ => StoreError::Rejected {
            status: status.as_u16(),
            message,
        },
    })
}

/// A 404 on an attachment URL means the attachment (or the whole document)
/// is missing.
async fn read_attachment(
    response: Response,
    id: &TaskId,
    filename: &str,
) -> Result<StoredAttachment, StoreError> {
    if response.status() == StatusCode::NOT_FOUND {
        return Err(StoreError::AttachmentNotFound {
            id: id.clone(),
            filename: filename.to_string(),
        });
    }
    let response = checked(response, Some(id)).await?;
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = response.bytes().await?.to_vec();
    Ok(StoredAttachment { content_type, data })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Mango selector for documents in `state`, optionally created at or after
/// `min_created`.
pub(crate) fn state_selector(state: LifecycleState, min_created: Option<DateTime<Utc>>) -> Value {
    fn exists(present: bool) -> Value {
        json!({ "$exists": present })
    }

    let mut selector = match state {
        LifecycleState::Pending => json!({
            "queued": exists(false),
            "started": exists(false),
            "completed": exists(false),
        }),
        LifecycleState::Queued => json!({
            "queued": exists(true),
            "started": exists(false),
            "completed": exists(false),
        }),
        LifecycleState::Started => json!({
            "started": exists(true),
            "completed": exists(false),
        }),
        LifecycleState::Completed => json!({
            "completed": exists(true),
        }),
    };
    if let Some(min) = min_created {
        selector["created"] = json!({ "$gte": epoch_seconds::to_seconds(&min) });
    }
    selector
}

fn since_param(since: &Value) -> String {
    match since {
        Value::String(seq) => seq.clone(),
        other => other.to_string(),
    }
}

/// Bookmark for the next `_find` page; `None` once a short page (or a page
/// without a bookmark) says there is nothing left.
fn next_bookmark(count: usize, page_size: usize, bookmark: Option<String>) -> Option<String> {
    if count < page_size {
        None
    } else {
        bookmark
    }
}

/// Ids by creation time, then id. Documents without `created` come first.
fn oldest_first(mut rows: Vec<FindRow>) -> Vec<TaskId> {
    rows.sort_by(|a, b| {
        a.created
            .unwrap_or(0.0)
            .total_cmp(&b.created.unwrap_or(0.0))
            .then_with(|| a.id.cmp(&b.id))
    });
    rows.into_iter().map(|row| row.id).collect()
}

fn bulk_outcomes(rows: Vec<BulkRow>) -> Vec<BatchResult> {
    rows.into_iter()
        .map(|row| {
            let outcome = match (row.rev, row.error) {
                (Some(rev), None) => BatchOutcome::Saved(rev),
                (_, Some(error)) if error == "conflict" => BatchOutcome::Conflict,
                (_, Some(error)) => {
                    BatchOutcome::Failed(format!("{error}: {}", row.reason.unwrap_or_default()))
                }
                (None, None) => BatchOutcome::Failed("no revision returned".to_string()),
            };
            BatchResult { id: row.id, outcome }
        })
        .collect()
}

#[async_trait]
impl TaskStore for CouchStore {
    async fn get(&self, id: &TaskId) -> Result<TaskDocument, StoreError> {
        let url = self.url(&[id.as_str()])?;
        let response = self.request(Method::GET, url).send().await?;
        decode(checked(response, Some(id)).await?).await
    }

    async fn save(&self, doc: &mut TaskDocument) -> Result<Revision, StoreError> {
        let url = self.url(&[doc.id.as_str()])?;
        let response = self.request(Method::PUT, url).json(&*doc).send().await?;
        let written: WriteResponse = decode(checked(response, Some(&doc.id)).await?).await?;
        doc.rev = Some(written.rev.clone());
        Ok(written.rev)
    }

    async fn put_attachment(
        &self,
        id: &TaskId,
        rev: &Revision,
        attachment: &Attachment,
    ) -> Result<Revision, StoreError> {
        let mut url = self.url(&[id.as_str(), &attachment.filename])?;
        url.query_pairs_mut().append_pair("rev", rev.as_str());

        let response = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, attachment.content_type.as_str())
            .body(attachment.contents.clone())
            .send()
            .await?;
        let written: WriteResponse = decode(checked(response, Some(id)).await?).await?;
        Ok(written.rev)
    }

    async fn get_attachment(
        &self,
        id: &TaskId,
        filename: &str,
    ) -> Result<StoredAttachment, StoreError> {
        let url = self.url(&[id.as_str(), filename])?;
        let response = self.request(Method::GET, url).send().await?;
        read_attachment(response, id, filename).await
    }

    async fn batch_update(
        &self,
        docs: Vec<TaskDocument>,
    ) -> Result<Vec<BatchResult>, StoreError> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url(&["_bulk_docs"])?;
        let response = self
            .request(Method::POST, url)
            .json(&json!({ "docs": docs }))
            .send()
            .await?;
        let rows: Vec<BulkRow> = decode(checked(response, None).await?).await?;
        Ok(bulk_outcomes(rows))
    }

    async fn find_by_state_and_age(
        &self,
        state: LifecycleState,
        min_created: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let selector = state_selector(state, min_created);
        let url = self.url(&["_find"])?;
        let mut rows = Vec::new();
        let mut bookmark: Option<String> = None;

        loop {
            let mut query = json!({
                "selector": selector,
                "fields": ["_id", "created"],
                "limit": self.page_size,
            });
            if let Some(bookmark) = &bookmark {
                query["bookmark"] = json!(bookmark);
            }

            let response = self
                .request(Method::POST, url.clone())
                .json(&query)
                .send()
                .await?;
            let page: FindResponse = decode(checked(response, None).await?).await?;

            let count = page.docs.len();
            rows.extend(page.docs);
            debug!(%state, count, total = rows.len(), "index query page");
            bookmark = next_bookmark(count, self.page_size, page.bookmark);
            if bookmark.is_none() {
                break;
            }
        }

        Ok(oldest_first(rows))
    }

    fn pending(&self, stop: watch::Receiver<bool>) -> Box<dyn PendingFeed> {
        Box::new(CouchFeed {
            store: self.clone(),
            since: json!(0),
            buffer: VecDeque::new(),
            failures: 0,
            stop,
        })
    }
}

/// Long-polls the filtered changes feed, resuming from the last sequence.
struct CouchFeed {
    store: CouchStore,
    since: Value,
    buffer: VecDeque<TaskId>,
    failures: u32,
    stop: watch::Receiver<bool>,
}

impl CouchFeed {
    /// Queue a page's ids and resume after its last sequence.
    fn absorb(&mut self, page: ChangesPage) {
        self.failures = 0;
        debug!(since = %page.last_seq, count = page.ids.len(), "changes feed page");
        self.since = page.last_seq;
        self.buffer.extend(page.ids);
    }

    /// Count a failed poll and return the delay before reconnecting. `since`
    /// is left alone so the next poll picks up where the last good one ended.
    fn backoff(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.store.reconnect.next_delay(self.failures)
    }
}

#[async_trait]
impl PendingFeed for CouchFeed {
    async fn next_id(&mut self) -> Result<Option<TaskId>, StoreError> {
        loop {
            let stopped = *self.stop.borrow();
            if stopped {
                return Ok(None);
            }
            if let Some(id) = self.buffer.pop_front() {
                return Ok(Some(id));
            }

            let polled = tokio::select! {
                polled = self.store.poll_changes(&self.since) => polled,
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                    continue;
                }
            };

            match polled {
                Ok(page) => self.absorb(page),
                Err(err) => {
                    let delay = self.backoff();
                    warn!(
                        error = %err,
                        failures = self.failures,
                        delay_ms = delay.as_millis() as u64,
                        "changes feed request failed, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = self.stop.changed() => {
                            if changed.is_err() {
                                return Ok(None);
                            }
                        }
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn store(url: &str) -> CouchStore {
        CouchStore::new(&StoreConfig::new(url, "ci")).unwrap()
    }

    fn response(status: u16, body: &str) -> Response {
        http::Response::builder()
            .status(status)
            .body(body.to_string())
            .unwrap()
            .into()
    }

    fn feed() -> (CouchFeed, watch::Sender<bool>) {
        let (stop_tx, stop) = watch::channel(false);
        let feed = CouchFeed {
            store: store("http://couch.local:5984"),
            since: json!(0),
            buffer: VecDeque::new(),
            failures: 0,
            stop,
        };
        (feed, stop_tx)
    }

    fn find_rows(value: Value) -> Vec<FindRow> {
        serde_json::from_value::<FindResponse>(value).unwrap().docs
    }

    #[tokio::test]
    async fn successful_responses_pass_through() {
        let ok = checked(response(201, r#"{"ok":true,"rev":"2-b"}"#), None)
            .await
            .unwrap();
        let written: WriteResponse = decode(ok).await.unwrap();
        assert_eq!(written.rev, Revision::new("2-b"));
    }

    #[rstest]
    #[case::stale_revision(409, true, "conflict")]
    #[case::missing_document(404, true, "not_found")]
    #[case::server_error(503, true, "unavailable")]
    #[case::gateway_error(502, false, "unavailable")]
    #[case::bad_request(400, true, "rejected")]
    #[case::not_found_without_document(404, false, "rejected")]
    #[case::conflict_without_document(409, false, "rejected")]
    #[tokio::test]
    async fn error_statuses_map_to_store_errors(
        #[case] status: u16,
        #[case] for_document: bool,
        #[case] expected: &str,
    ) {
        let id = TaskId::new("t1");
        let err = checked(
            response(status, r#"{"error":"x","reason":"y"}"#),
            for_document.then_some(&id),
        )
        .await
        .unwrap_err();

        let actual = match &err {
            StoreError::Conflict(got) | StoreError::NotFound(got) => {
                assert_eq!(got, &id);
                if err.is_conflict() { "conflict" } else { "not_found" }
            }
            StoreError::Unavailable(message) => {
                assert!(message.contains(&status.to_string()), "{message}");
                "unavailable"
            }
            StoreError::Rejected { status: got, message } => {
                assert_eq!(*got, status);
                assert!(message.contains("reason"), "{message}");
                "rejected"
            }
            other => panic!("unexpected error: {other:?}"),
        };
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn missing_attachment_is_reported_by_filename() {
        let id = TaskId::new("t1");
        let err = read_attachment(response(404, r#"{"error":"not_found"}"#), &id, "log.txt")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::AttachmentNotFound { id: got, filename } if got == id && filename == "log.txt"
        ));
    }

    #[tokio::test]
    async fn attachment_body_and_type_are_returned() {
        let id = TaskId::new("t1");
        let with_type: Response = http::Response::builder()
            .status(200)
            .header("content-type", "text/plain")
            .body("hello".to_string())
            .unwrap()
            .into();
        let stored = read_attachment(with_type, &id, "log.txt").await.unwrap();
        assert_eq!(stored.content_type, "text/plain");
        assert_eq!(stored.data, b"hello");

        let untyped = read_attachment(response(200, "raw"), &id, "blob").await.unwrap();
        assert_eq!(untyped.content_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn attachment_server_errors_stay_unavailable() {
        let id = TaskId::new("t1");
        let err = read_attachment(response(500, "boom"), &id, "log.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn changes_page_skips_deleted_rows() {
        let changes: ChangesResponse = serde_json::from_value(json!({
            "results": [
                {"seq": "1-a", "id": "t1", "changes": []},
                {"seq": "2-a", "id": "t2", "changes": [], "deleted": true},
                {"seq": "3-a", "id": "t3", "changes": []},
            ],
            "last_seq": "3-a",
        }))
        .unwrap();

        let page = ChangesPage::from(changes);
        assert_eq!(page.ids, vec![TaskId::new("t1"), TaskId::new("t3")]);
        assert_eq!(page.last_seq, json!("3-a"));
    }

    #[tokio::test]
    async fn feed_resumes_from_last_good_sequence() {
        let (mut feed, _stop) = feed();
        feed.absorb(ChangesPage {
            ids: vec![TaskId::new("t1"), TaskId::new("t2")],
            last_seq: json!("5-x"),
        });
        assert_eq!(feed.since, json!("5-x"));

        assert_eq!(feed.backoff(), Duration::from_secs(1));
        assert_eq!(feed.backoff(), Duration::from_secs(2));
        assert_eq!(feed.failures, 2);
        assert_eq!(feed.since, json!("5-x"));

        // Ids buffered before the failures are still handed out.
        assert_eq!(feed.next_id().await.unwrap(), Some(TaskId::new("t1")));
        assert_eq!(feed.next_id().await.unwrap(), Some(TaskId::new("t2")));

        feed.absorb(ChangesPage {
            ids: vec![TaskId::new("t3")],
            last_seq: json!("6-x"),
        });
        assert_eq!(feed.failures, 0);
        assert_eq!(feed.since, json!("6-x"));
        assert_eq!(feed.backoff(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stopped_feed_yields_nothing_even_when_buffered() {
        let (mut feed, stop) = feed();
        feed.absorb(ChangesPage {
            ids: vec![TaskId::new("t1")],
            last_seq: json!(1),
        });
        stop.send(true).unwrap();
        assert_eq!(feed.next_id().await.unwrap(), None);
    }

    #[rstest]
    #[case::full_page_continues(100, Some("g1"), Some("g1"))]
    #[case::short_page_ends(40, Some("g1"), None)]
    #[case::empty_page_ends(0, Some("g1"), None)]
    #[case::missing_bookmark_ends(100, None, None)]
    fn find_paging_follows_bookmarks(
        #[case] count: usize,
        #[case] bookmark: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(
            next_bookmark(count, 100, bookmark.map(str::to_string)).as_deref(),
            expected
        );
    }

    #[test]
    fn find_results_are_ordered_oldest_first() {
        let mut rows = find_rows(json!({
            "docs": [
                {"_id": "c", "created": 1_700_000_020.0},
                {"_id": "b", "created": 1_700_000_010.0},
            ],
            "bookmark": "g1",
        }));
        rows.extend(find_rows(json!({
            "docs": [
                {"_id": "a", "created": 1_700_000_010.0},
                {"_id": "legacy"},
            ],
        })));

        let ids = oldest_first(rows);
        assert_eq!(
            ids,
            vec![
                TaskId::new("legacy"),
                TaskId::new("a"),
                TaskId::new("b"),
                TaskId::new("c"),
            ]
        );
    }

    #[test]
    fn urls_are_scoped_to_the_database_and_encoded() {
        let store = store("http://couch.local:5984/");
        assert_eq!(
            store.url(&["t1"]).unwrap().as_str(),
            "http://couch.local:5984/ci/t1"
        );
        assert_eq!(
            store.url(&["build/42", "build log.txt"]).unwrap().as_str(),
            "http://couch.local:5984/ci/build%2F42/build%20log.txt"
        );

        let prefixed = self::store("http://proxy.local/couch");
        assert_eq!(
            prefixed.url(&["_find"]).unwrap().as_str(),
            "http://proxy.local/couch/ci/_find"
        );
    }

    #[test]
    fn rejects_unusable_urls() {
        let err = CouchStore::new(&StoreConfig::new("mailto:ci@example.org", "ci")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidUrl(_)));
        let err = CouchStore::new(&StoreConfig::new("not a url", "ci")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidUrl(_)));
    }

    #[test]
    fn pending_selector_requires_all_lifecycle_fields_absent() {
        let selector = state_selector(LifecycleState::Pending, None);
        assert_eq!(
            selector,
            json!({
                "queued": {"$exists": false},
                "started": {"$exists": false},
                "completed": {"$exists": false},
            })
        );
    }

    #[test]
    fn started_selector_excludes_completed_and_filters_age() {
        let min = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let selector = state_selector(LifecycleState::Started, Some(min));
        assert_eq!(
            selector,
            json!({
                "started": {"$exists": true},
                "completed": {"$exists": false},
                "created": {"$gte": 1_700_000_000.0},
            })
        );
    }

    #[test]
    fn bulk_rows_map_to_per_document_outcomes() {
        let rows: Vec<BulkRow> = serde_json::from_value(json!([
            {"ok": true, "id": "a", "rev": "3-x"},
            {"id": "b", "error": "conflict", "reason": "Document update conflict."},
            {"id": "c", "error": "forbidden", "reason": "read only"},
        ]))
        .unwrap();

        let results = bulk_outcomes(rows);
        assert_eq!(results[0].outcome, BatchOutcome::Saved(Revision::new("3-x")));
        assert_eq!(results[1].outcome, BatchOutcome::Conflict);
        assert_eq!(
            results[2].outcome,
            BatchOutcome::Failed("forbidden: read only".to_string())
        );
        assert_eq!(results[2].id, TaskId::new("c"));
    }

    #[test]
    fn since_accepts_numeric_and_opaque_sequences() {
        assert_eq!(since_param(&json!(0)), "0");
        assert_eq!(since_param(&json!("12-g1AAAA")), "12-g1AAAA");
    }
}

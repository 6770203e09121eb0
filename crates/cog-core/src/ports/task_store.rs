//! TaskStore port - タスクドキュメントの正本（source of truth）
//!
//! TaskStore は以下を提供します：
//! - 単一ドキュメントの get / save（revision による楽観的並行性制御）
//! - 添付ファイルの保存と取得
//! - recovery 用の一括更新（ドキュメント単位で成否を返す、非アトミック）
//! - pending フィード（dispatch 候補の task_id を遅延的に流す）
//! - 状態 + 作成時刻による索引検索
//!
//! # 実装
//! - `impls::CouchStore`: CouchDB (HTTP)
//! - `impls::InMemoryTaskStore`: テスト・ローカル実行用

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::{Attachment, LifecycleState, Revision, StoreError, TaskDocument, TaskId};

/// Per-document result of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Saved(Revision),
    Conflict,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub id: TaskId,
    pub outcome: BatchOutcome,
}

/// An attachment as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// PendingFeed は dispatch 候補の task_id を順に返す
///
/// # 契約
/// - 返された id のドキュメントが、参照時点で既に存在しない・pending でない
///   ことがある（フィードと状態の結果整合性）。呼び出し側は skip する
/// - `Ok(None)` はフィードの終了（stop シグナル受信）
/// - 接続断は内部で再接続する。再接続に失敗した場合のみ `Err` を返し、
///   次の呼び出しで再開する
#[async_trait]
pub trait PendingFeed: Send {
    async fn next_id(&mut self) -> Result<Option<TaskId>, StoreError>;
}

/// TaskStore はタスクドキュメントの読み書きを抽象化
///
/// # 設計原則
/// - ローカルキャッシュを持たない（すべての呼び出しがリモートの現状を反映）
/// - 書き込みは revision 付きで行い、古い revision は `StoreError::Conflict`
/// - save 成功後の read は、その書き込みを反映している（read-your-writes）
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: &TaskId) -> Result<TaskDocument, StoreError>;

    /// Persist `doc`. On success `doc.rev` holds the new revision.
    ///
    /// A document without a revision is created; the write fails with
    /// `Conflict` if it already exists.
    async fn save(&self, doc: &mut TaskDocument) -> Result<Revision, StoreError>;

    /// Store one attachment against revision `rev`; returns the new revision.
    async fn put_attachment(
        &self,
        id: &TaskId,
        rev: &Revision,
        attachment: &Attachment,
    ) -> Result<Revision, StoreError>;

    async fn get_attachment(
        &self,
        id: &TaskId,
        filename: &str,
    ) -> Result<StoredAttachment, StoreError>;

    /// Best-effort bulk write. Every input document gets exactly one result.
    async fn batch_update(
        &self,
        docs: Vec<TaskDocument>,
    ) -> Result<Vec<BatchResult>, StoreError>;

    /// Ids of documents in `state` created at or after `min_created`.
    async fn find_by_state_and_age(
        &self,
        state: LifecycleState,
        min_created: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskId>, StoreError>;

    /// Open a pending feed that ends once `stop` flips to `true` (or its
    /// sender is dropped).
    fn pending(&self, stop: watch::Receiver<bool>) -> Box<dyn PendingFeed>;
}

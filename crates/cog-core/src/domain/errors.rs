//! Errors - ストア操作のエラーと分類
//!
//! ErrorKind は呼び出し側の判断（skip / retry / fatal）に使う運用分類です。

use thiserror::Error;

use super::ids::TaskId;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（skip して続行、または再取得して再試行）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（ストアへの接続断など）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Errors raised by a task store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} was modified concurrently (stale revision)")]
    Conflict(TaskId),

    #[error("task {0} has no revision; fetch it from the store before writing")]
    MissingRevision(TaskId),

    #[error("attachment '{filename}' not found on task {id}")]
    AttachmentNotFound { id: TaskId, filename: String },

    #[error("invalid store url: {0}")]
    InvalidUrl(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_)
            | StoreError::Conflict(_)
            | StoreError::AttachmentNotFound { .. } => ErrorKind::Transient,
            StoreError::MissingRevision(_)
            | StoreError::InvalidUrl(_)
            | StoreError::Rejected { .. }
            | StoreError::Malformed(_) => ErrorKind::Permanent,
            StoreError::Unavailable(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

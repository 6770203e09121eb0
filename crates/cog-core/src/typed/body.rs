//! TaskBody trait - Task を実行する本体の定義
//!
//! # 二層構造
//! - `TaskBody<T>`: 型付き（kwargs はデコード済みの `T`）
//! - `DynTaskBody`: object-safe、レジストリに格納するための型消去層

use std::marker::PhantomData;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::task::Task;
use crate::domain::{TaskDocument, TaskOutcome};

/// Errors a task body may raise. The runner records any of them as a failed
/// result; none of them aborts the worker.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("invalid kwargs: {0}")]
    InvalidKwargs(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),

    #[error("{action}: {source}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },
}

impl BodyError {
    pub fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        BodyError::Io {
            action: action.into(),
            source,
        }
    }
}

/// TaskBody は Task を実行して TaskOutcome を返す
///
/// `work_dir` は runner が作成した専用の作業ディレクトリで、`run` の終了後に
/// 中身ごと削除されます。
#[async_trait]
pub trait TaskBody<T: Task>: Send + Sync {
    async fn run(
        &self,
        task: T,
        document: &TaskDocument,
        work_dir: &Path,
    ) -> Result<TaskOutcome, BodyError>;
}

/// DynTaskBody は object-safe な TaskBody の抽象化
///
/// `HashMap<String, Arc<dyn DynTaskBody>>` に格納できるようにします。
#[async_trait]
pub trait DynTaskBody: Send + Sync {
    async fn run_dyn(
        &self,
        document: &TaskDocument,
        work_dir: &Path,
    ) -> Result<TaskOutcome, BodyError>;

    fn name(&self) -> &'static str;
}

pub struct TypedTaskBody<T: Task, B: TaskBody<T>> {
    body: B,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, B: TaskBody<T>> TypedTaskBody<T, B> {
    pub fn new(body: B) -> Self {
        Self {
            body,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, B: TaskBody<T>> DynTaskBody for TypedTaskBody<T, B> {
    async fn run_dyn(
        &self,
        document: &TaskDocument,
        work_dir: &Path,
    ) -> Result<TaskOutcome, BodyError> {
        let task: T = serde_json::from_value(Value::Object(document.kwargs.clone()))?;
        self.body.run(task, document, work_dir).await
    }

    fn name(&self) -> &'static str {
        T::NAME
    }
}

//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 設計
//! - Builder パターンで TaskBody を登録
//! - 起動時検証（Fail-fast 設計）

use std::sync::Arc;

use crate::typed::{RegistryError, Task, TaskBody, TaskRegistry};

/// AppBuilder は TaskRunner が使うレジストリを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<BuildTask, _>(BuildBody)?
///     .expect_tasks(&["build"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task 名を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct AppBuilder {
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task bodies: {0:?}; these tasks were expected but not registered")]
    MissingTaskTypes(Vec<String>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TaskRegistry::new(),
            expected_tasks: None,
        }
    }

    /// TaskBody を登録
    pub fn register<T: Task, B: TaskBody<T> + 'static>(
        mut self,
        body: B,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, B>(body)?;
        Ok(self)
    }

    /// 期待される task 名のリストを設定
    pub fn expect_tasks(mut self, names: &[&str]) -> Self {
        self.expected_tasks = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    /// 検証して App を生成
    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        Ok(App {
            registry: Arc::new(self.registry),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// App は構築済みのレジストリを保持
pub struct App {
    pub registry: Arc<TaskRegistry>,
}

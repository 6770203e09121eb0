//! TaskRegistry - TaskBody の登録と管理

use std::collections::HashMap;
use std::sync::Arc;

use super::body::{DynTaskBody, TaskBody, TypedTaskBody};
use super::task::Task;

/// TaskRegistry は task 名 → TaskBody の対応を管理
///
/// # 使用例
/// ```ignore
/// let mut registry = TaskRegistry::new();
/// registry.register::<BuildTask, _>(BuildBody)?;
///
/// let body = registry.get("build");
/// ```
#[derive(Default, Clone)]
pub struct TaskRegistry {
    bodies: HashMap<&'static str, Arc<dyn DynTaskBody>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a task body named '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, B: TaskBody<T> + 'static>(
        &mut self,
        body: B,
    ) -> Result<(), RegistryError> {
        if self.bodies.contains_key(T::NAME) {
            return Err(RegistryError::AlreadyRegistered(T::NAME.to_string()));
        }
        self.bodies
            .insert(T::NAME, Arc::new(TypedTaskBody::<T, B>::new(body)));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynTaskBody>> {
        self.bodies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bodies.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bodies.keys().map(|name| name.to_string()).collect();
        names.sort();
        names
    }
}

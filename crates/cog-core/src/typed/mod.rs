//! Typed - 型付き TaskBody API
//!
//! このモジュールは task 名の typo や kwargs の型不一致を型で排除し、
//! TaskBody との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `TaskBody<T>` trait - 型安全
//! - **内部（Dyn）**: `DynTaskBody` trait - object-safe, type erasure

pub mod body;
pub mod registry;
pub mod task;

// 主要な trait/型 を再エクスポート
pub use self::body::{BodyError, DynTaskBody, TaskBody, TypedTaskBody};
pub use self::registry::{RegistryError, TaskRegistry};
pub use self::task::Task;

//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **CouchStore**: CouchDB (HTTP) による TaskStore
//! - **InMemoryTaskStore**: テスト・ローカル実行用の TaskStore
//! - **SlurmSubmitter**: `q` コマンド経由の JobSubmitter
//! - **ReconnectPolicy**: フィード再接続のバックオフ

pub mod couch;
pub mod memory_store;
pub mod retry;
pub mod slurm;

// 主要な型を再エクスポート
pub use self::couch::CouchStore;
pub use self::memory_store::InMemoryTaskStore;
pub use self::retry::ReconnectPolicy;
pub use self::slurm::SlurmSubmitter;

//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてタスクのライフサイクルを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: タスク本体の登録とワイヤリング
//! - **Dispatcher**: pending → queued、クラスタへのジョブ投入
//! - **TaskRunner**: queued → started → completed（クラスタノード上で実行）
//! - **Recovery**: 取り残されたタスクを pending に戻す

pub mod builder;
pub mod dispatcher;
pub mod recovery;
pub mod runner;

#[cfg(test)]
pub(crate) mod scenarios;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::dispatcher::{
    DispatchOutcome, DispatchStats, Dispatcher, SkipReason, WorkerCommand,
};
pub use self::recovery::{DEFAULT_BATCH_SIZE, Recovery, RecoveryError, RecoveryReport};
pub use self::runner::{RunnerError, TaskReport, TaskRunner};

//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（ドキュメントストア、クラスタの投入ツール、時刻）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ドキュメントストアが source of truth（正本）
//! - クラスタへの投入は fire-and-forget
//! - 時刻は Clock 経由（テストで固定可能）

pub mod clock;
pub mod submitter;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::submitter::{JobRequest, JobSubmitter, OutputPaths, Placement, SubmitError};
pub use self::task_store::{BatchOutcome, BatchResult, PendingFeed, StoredAttachment, TaskStore};

//! cog-core
//!
//! Core building blocks of the cog CI task engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, document, results, partition, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, JobSubmitter, Clock）
//! - **impls**: 実装（CouchStore, InMemoryTaskStore, SlurmSubmitter）
//! - **typed**: 型付き Task API（Task trait, TaskBody trait, TaskRegistry）
//! - **tasks**: 組み込みタスク（shell, build, fixme）
//! - **app**: アプリケーションロジック（dispatcher, runner, recovery）
//! - **config**: 設定ファイルと環境変数の読み込み

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod tasks;
pub mod typed;

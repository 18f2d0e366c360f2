//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: store / sink / registry / config のワイヤリング
//! - **ExecutorRegistry**: step → StepExecutor の解決
//! - **Worker / WorkerGroup**: claim → execute → finalize ループ
//! - **Heartbeat**: 実行中ジョブの touch + heartbeat イベント
//! - **QueueCounts**: status 別の集計（inspection 用）

pub mod builder;
pub mod config;
pub mod heartbeat;
pub mod registry;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::config::{ConfigError, WorkerConfig};
pub use self::heartbeat::Heartbeat;
pub use self::registry::{ExecutorRegistry, RegistryError};
pub use self::status::QueueCounts;
pub use self::worker_loop::{
    Disposition, JobReport, ShutdownHandle, Tick, Worker, WorkerError, WorkerGroup, WorkerStats,
};

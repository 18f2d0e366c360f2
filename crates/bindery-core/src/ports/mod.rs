//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。
//! 各 trait は外部システム（PostgreSQL, step executor, dashboard 用イベントログ）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! - JobStore が source of truth（正本）
//! - プロセス間の排他は JobStore::claim_next だけが担う

pub mod clock;
pub mod event_sink;
pub mod executor;
pub mod id_generator;
pub mod job_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, EventSinkError};
pub use self::executor::StepExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::{JobStore, RetryDecision};

//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryJobStore**: テスト / ローカル実行用の JobStore
//! - **StoreEventSink**: JobStore のイベントログに書く EventSink
//! - **TracingEventSink**: tracing に流すだけの EventSink
//!
//! PostgreSQL 実装は `bindery-pg` クレートにあります。

pub mod memory;
pub mod store_sink;
pub mod tracing_sink;

pub use self::memory::InMemoryJobStore;
pub use self::store_sink::StoreEventSink;
pub use self::tracing_sink::TracingEventSink;

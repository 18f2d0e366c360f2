//! bindery-core
//!
//! Dependency-aware job queue for the book production pipeline.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, state, step, outcome, event, plan, errors）
//! - **ports**: 抽象化レイヤー（JobStore, StepExecutor, EventSink, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, registry, worker_loop, heartbeat, config, status）
//! - **impls**: 実装（InMemoryJobStore, StoreEventSink, TracingEventSink）
//! - **observability**: tracing subscriber の初期化
//!
//! PostgreSQL の JobStore は `bindery-pg` にあります。

pub mod app;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

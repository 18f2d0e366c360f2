//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID
//! Job と Event の ID は ULID を使います。
//! - **時刻でソート可能**: 生成順に並ぶので created_at の tie-break にも使える
//! - **分散生成可能**: 複数の worker / planner プロセスで調整なしに生成できる
//!
//! `Id<T>` は Phantom type パターンで `JobId` と `EventId` を区別します。
//! 文字列表現は `job-<ULID>` / `evt-<ULID>` で、DB にもこの形で保存します。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Display prefix (e.g. "job-").
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// `T` は実行時にはメモリを消費しない（PhantomData）。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a string is not a valid `<prefix><ULID>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {expected}id: {input:?}")]
pub struct ParseIdError {
    expected: &'static str,
    input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed form and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                expected: T::prefix(),
                input: s.to_string(),
            })
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobMarker {}

impl IdMarker for JobMarker {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventMarker {}

impl IdMarker for EventMarker {
    fn prefix() -> &'static str {
        "evt-"
    }
}

/// Identifier of a Job (claim / finalize / cancel unit).
pub type JobId = Id<JobMarker>;

/// Identifier of an entry in the event log.
pub type EventId = Id<EventMarker>;

/// Identifier of the worker holding a claim.
///
/// Free-form string (`<host>-<pid>-<n>` by default); only equality matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

//! Replication integration.
//!
//! Every mutation, data or access-control, becomes one [`LogEntry`]. The
//! replica set ships entries between members through [`ReplicaSetControl`];
//! divergent members reconcile through [`rollback`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use warden_common::Result;

use crate::storage::{DocWrite, is_auth_namespace};

pub mod rollback;
pub mod set;

pub use rollback::{RollbackPlan, find_common_point, plan_rollback};
pub use set::{MemberSpec, ReplicaSet};

/// Index of a member inside its replica set.
pub type MemberId = usize;

/// Position of an entry in the replicated log.
///
/// Positions order by term, then index. Entries from different terms never
/// share a position.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition {
    pub term: u64,
    pub index: u64,
}

impl LogPosition {
    /// Position before the first entry of every log.
    pub const ZERO: LogPosition = LogPosition { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    /// The position a new entry gets when appended after `self` in `term`.
    pub fn next(self, term: u64) -> Self {
        Self {
            term: term.max(self.term),
            index: self.index + 1,
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.term, self.index)
    }
}

/// One logical mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub position: LogPosition,
    pub writes: Vec<DocWrite>,
}

impl LogEntry {
    /// Whether applying this entry changes users or roles.
    pub fn touches_auth(&self) -> bool {
        self.writes.iter().any(|w| is_auth_namespace(&w.ns))
    }
}

/// A member's retained log.
///
/// `start` is the position of the last entry folded into a checkpoint (or
/// [`LogPosition::ZERO`]); `entries` follow it in position order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogView {
    pub start: LogPosition,
    pub entries: Vec<LogEntry>,
}

impl LogView {
    pub fn last(&self) -> LogPosition {
        self.entries.last().map(|e| e.position).unwrap_or(self.start)
    }

    pub fn contains(&self, position: LogPosition) -> bool {
        position == self.start
            || self
                .entries
                .binary_search_by_key(&position, |e| e.position)
                .is_ok()
    }

    /// Entries strictly after `position`.
    pub fn after(&self, position: LogPosition) -> &[LogEntry] {
        let split = self.entries.partition_point(|e| e.position <= position);
        &self.entries[split..]
    }
}

// Member state

/// Replica-set member state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Primary,
    Secondary,
    /// Undoing divergent entries; requests are refused.
    Rollback,
    /// Rollback finished, re-validating derived state.
    RecoveringFromRollback,
    /// Rollback could not complete. The member stops voting.
    Fatal,
    Down,
}

impl MemberState {
    /// Whether the member may answer requests.
    pub fn is_readable(self) -> bool {
        matches!(self, MemberState::Primary | MemberState::Secondary)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
            MemberState::Rollback => "ROLLBACK",
            MemberState::RecoveringFromRollback => "RECOVERING",
            MemberState::Fatal => "FATAL",
            MemberState::Down => "DOWN",
        };
        f.write_str(name)
    }
}

/// Acknowledgment required before a write returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteConcern {
    /// A majority of voting members hold the entry.
    #[default]
    Majority,
    /// At least this many data-bearing members hold the entry.
    Nodes(u32),
    /// Return after the local commit.
    Unacknowledged,
}

/// One member as reported by `replSetGetStatus`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatusReport {
    pub id: MemberId,
    pub name: String,
    pub state: MemberState,
    pub last_applied: LogPosition,
    pub voting: bool,
    pub arbiter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplSetStatus {
    pub set: String,
    pub term: u64,
    pub members: Vec<MemberStatusReport>,
}

// Replica-set seam

/// Control surface a node consumes from its replica set.
#[async_trait]
pub trait ReplicaSetControl: Send + Sync {
    /// Ship a committed entry from `origin` to the other members.
    fn append_log_entry(&self, origin: MemberId, entry: &LogEntry) -> Result<()>;

    /// Wait until a majority of voters hold the entry at `position`.
    async fn await_majority_ack(
        &self,
        origin: MemberId,
        position: LogPosition,
        timeout: Duration,
    ) -> Result<()>;

    /// Wait until `count` data-bearing members hold the entry at `position`.
    async fn await_acks(
        &self,
        origin: MemberId,
        position: LogPosition,
        count: usize,
        timeout: Duration,
    ) -> Result<()>;

    /// Current view of every member.
    fn status(&self) -> ReplSetStatus;
}

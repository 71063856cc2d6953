//! Sync report counters (SPEC_FULL.md §3, §6).
//!
//! Counters are grouped by `(ITEM_LOCAL|ITEM_REMOTE) x
//! {ADDED,UPDATED,REMOVED,ANY} x {TOTAL,REJECT,SENT_BYTES,RECEIVED_BYTES,
//! MATCH,CONFLICT_SERVER_WON,CONFLICT_CLIENT_WON,CONFLICT_DUPLICATED}`.
//! Stored flat as `source-<name>-stat-<location>-<state>-<result>` keys
//! per the on-disk layout in SPEC_FULL.md §6, so persistence is just a
//! `HashMap<String, u64>` underneath a typed view.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::engine::DsStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    Added,
    Updated,
    Removed,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Total,
    Reject,
    SentBytes,
    ReceivedBytes,
    Match,
    ConflictServerWon,
    ConflictClientWon,
    ConflictDuplicated,
}

/// One source's counters for one session, keyed flat as the on-disk
/// layout requires but read back through `get`/`set`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceReport {
    pub counters: HashMap<String, u64>,
    pub status: u16,
}

fn key(location: Location, state: ItemState, result: Outcome) -> String {
    let loc = match location {
        Location::Local => "local",
        Location::Remote => "remote",
    };
    let st = match state {
        ItemState::Added => "added",
        ItemState::Updated => "updated",
        ItemState::Removed => "removed",
        ItemState::Any => "any",
    };
    let res = match result {
        Outcome::Total => "total",
        Outcome::Reject => "reject",
        Outcome::SentBytes => "sent_bytes",
        Outcome::ReceivedBytes => "received_bytes",
        Outcome::Match => "match",
        Outcome::ConflictServerWon => "conflict_server_won",
        Outcome::ConflictClientWon => "conflict_client_won",
        Outcome::ConflictDuplicated => "conflict_duplicated",
    };
    format!("stat-{loc}-{st}-{res}")
}

impl SourceReport {
    pub fn get(&self, location: Location, state: ItemState, result: Outcome) -> u64 {
        *self.counters.get(&key(location, state, result)).unwrap_or(&0)
    }

    pub fn set(&mut self, location: Location, state: ItemState, result: Outcome, value: u64) {
        self.counters.insert(key(location, state, result), value);
    }

    pub fn add(&mut self, location: Location, state: ItemState, result: Outcome, delta: u64) {
        let k = key(location, state, result);
        *self.counters.entry(k).or_insert(0) += delta;
    }

    /// Populates local/remote ADDED/UPDATED/REMOVED TOTAL and byte
    /// counters from one target's `DsStats`, plus conflict/reject
    /// counters.
    pub fn record_ds_stats(&mut self, stats: &DsStats) {
        self.set(Location::Local, ItemState::Added, Outcome::Total, stats.local_added as u64);
        self.set(Location::Local, ItemState::Updated, Outcome::Total, stats.local_updated as u64);
        self.set(Location::Local, ItemState::Removed, Outcome::Total, stats.local_removed as u64);
        self.set(Location::Remote, ItemState::Added, Outcome::Total, stats.remote_added as u64);
        self.set(Location::Remote, ItemState::Updated, Outcome::Total, stats.remote_updated as u64);
        self.set(Location::Remote, ItemState::Removed, Outcome::Total, stats.remote_removed as u64);
        self.set(Location::Local, ItemState::Any, Outcome::SentBytes, stats.sent_bytes);
        self.set(Location::Local, ItemState::Any, Outcome::ReceivedBytes, stats.received_bytes);
        self.set(Location::Local, ItemState::Any, Outcome::Reject, stats.rejects as u64);
        self.set(Location::Local, ItemState::Any, Outcome::Match, stats.slow_matches as u64);
        self.set(
            Location::Local,
            ItemState::Any,
            Outcome::ConflictServerWon,
            stats.conflict_server_won as u64,
        );
        self.set(
            Location::Local,
            ItemState::Any,
            Outcome::ConflictClientWon,
            stats.conflict_client_won as u64,
        );
        self.set(
            Location::Local,
            ItemState::Any,
            Outcome::ConflictDuplicated,
            stats.conflict_duplicated as u64,
        );
    }

    /// No-phantom-accounting invariant check (SPEC_FULL.md §8 invariant 4):
    /// local added+updated+removed must not exceed the total operations
    /// actually performed against the source.
    pub fn local_changes_total(&self) -> u64 {
        self.get(Location::Local, ItemState::Added, Outcome::Total)
            + self.get(Location::Local, ItemState::Updated, Outcome::Total)
            + self.get(Location::Local, ItemState::Removed, Outcome::Total)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub session_id: String,
    /// Keyed on source name in a `BTreeMap`, not a `HashMap`: the status
    /// propagation rule below depends on a deterministic iteration order.
    pub sources: BTreeMap<String, SourceReport>,
    /// First non-OK per-source status, or 200 if every source was OK.
    pub status: u16,
    /// New sync anchor per source, present whenever that source's session
    /// ended successfully with a non-empty anchor (invariant 5, SPEC_FULL.md
    /// §8) -- a caller persists these to drive the next incremental sync.
    pub anchors: BTreeMap<String, String>,
}

impl SyncReport {
    pub fn new(session_id: impl Into<String>) -> Self {
        SyncReport {
            session_id: session_id.into(),
            sources: BTreeMap::new(),
            status: 200,
            anchors: BTreeMap::new(),
        }
    }

    /// Overall status is the first non-OK per-source status in name order
    /// (SPEC_FULL.md §7 propagation rule).
    pub fn finalize_status(&mut self) {
        self.status = self
            .sources
            .values()
            .map(|s| s.status)
            .find(|&s| s != 200)
            .unwrap_or(200);
    }
}

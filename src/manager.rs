//! Session Manager (C6): external API surface, priority scheduling, and
//! signal fan-out.
//!
//! The teacher has no concurrency layer to generalize here -- its
//! `main()` just runs local/remote role dispatch sequentially -- so this
//! module is new code, grounded instead on the async-task-queue shape of
//! `get-convex-convex-backend`'s `worker.rs` and `pantsbuild/pants`'s
//! `session.rs`: a `BinaryHeap<Reverse<...>>` of pending requests drained
//! one at a time, each admission broadcast as a signal.
//!
//! The manager owns *scheduling*, not source/transport construction --
//! resolving a configuration into opened `SyncSource`s and a transport is
//! the caller's job (a concrete backend/CLI), handed to `start_session`
//! as a boxed unit of work. This keeps the manager independent of any one
//! datastore backend, matching SPEC_FULL.md §1's datastore non-goal.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};

use crate::config::{Config, FileConfigStore};
use crate::error::Result;
use crate::report::SyncReport;
use crate::session::SyncMode;

pub type ClientId = u64;
pub type SyncModeSet = HashMap<String, SyncMode>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    SessionChanged { config_name: String, active: bool },
    Presence { config_name: String, status: PresenceStatus },
    Status { session_id: String, status: u16 },
    Progress { session_id: String, detail: String },
}

pub type SignalStream = broadcast::Receiver<Signal>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Unknown,
    Present,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDescriptor {
    pub name: String,
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOp {
    Replace,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
}

/// A caller-supplied unit of work: run while holding the configuration's
/// exclusive slot. Built from an already-opened `SessionController` plus
/// transport, which the manager itself knows nothing about.
pub type SessionWork =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<SyncReport>> + Send>> + Send>;

struct QueueEntry {
    priority: u32,
    sequence: u64,
    responder: oneshot::Sender<()>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    /// Lower `priority` number wins (spec.md §4.6: server/connection-driven
    /// above client-initiated); ties broken FIFO by arrival sequence.
    /// `BinaryHeap` is a max-heap, so both comparisons are inverted.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

type ModifyLock = Arc<AsyncMutex<()>>;

pub struct SessionManager {
    store: FileConfigStore,
    queue: AsyncMutex<BinaryHeap<QueueEntry>>,
    locks: AsyncMutex<HashMap<String, ModifyLock>>,
    /// Enforces spec.md §5's "no two sessions execute the driver loop
    /// concurrently" across the whole manager, not just per configuration.
    global_slot: AsyncMutex<()>,
    signal_tx: broadcast::Sender<Signal>,
    sequence: AtomicU64,
    session_counter: AtomicU64,
}

impl SessionManager {
    pub fn new(store: FileConfigStore) -> Self {
        let (signal_tx, _) = broadcast::channel(256);
        SessionManager {
            store,
            queue: AsyncMutex::new(BinaryHeap::new()),
            locks: AsyncMutex::new(HashMap::new()),
            global_slot: AsyncMutex::new(()),
            signal_tx,
            sequence: AtomicU64::new(0),
            session_counter: AtomicU64::new(0),
        }
    }

    pub fn attach(&self, _client: ClientId) -> SignalStream {
        self.signal_tx.subscribe()
    }

    pub fn next_session_id(&self) -> String {
        let n = self.session_counter.fetch_add(1, AtomicOrdering::SeqCst);
        format!("session-{n}")
    }

    async fn lock_for(&self, config_name: &str) -> ModifyLock {
        let mut locks = self.locks.lock().await;
        locks
            .entry(config_name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Queues a request for `config_name`'s exclusive slot at `priority`,
    /// waits its turn, then runs `work` while holding both that
    /// configuration's lock and the manager's single global execution
    /// slot. Emits `SessionChanged` on acquire and release.
    pub async fn start_session(
        &self,
        config_name: &str,
        priority: u32,
        work: SessionWork,
    ) -> Result<SyncReport> {
        let config_lock = self.lock_for(config_name).await;

        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock().await;
            queue.push(QueueEntry {
                priority,
                sequence,
                responder: tx,
            });
        }
        self.admit_next().await;
        let _ = rx.await;

        let _config_guard = config_lock.lock().await;
        let _global_guard = self.global_slot.lock().await;

        let _ = self.signal_tx.send(Signal::SessionChanged {
            config_name: config_name.to_string(),
            active: true,
        });

        let result = work().await;

        let _ = self.signal_tx.send(Signal::SessionChanged {
            config_name: config_name.to_string(),
            active: false,
        });

        result
    }

    /// Wakes the single highest-priority queued entry, if any. Called on
    /// every arrival; actual serialization happens via the locks
    /// acquired immediately after a waiter is woken, so admission order
    /// here only governs priority, not exclusivity.
    async fn admit_next(&self) {
        let mut queue = self.queue.lock().await;
        if let Some(entry) = queue.pop() {
            let _ = entry.responder.send(());
        }
    }

    pub fn get_config(&self, name: &str) -> Result<Config> {
        self.store.load(name)
    }

    pub fn set_config(&self, name: &str, config: &Config) -> Result<()> {
        self.store.save(name, config)
    }

    pub fn get_reports(&self, config_name: &str, start: usize, count: usize) -> Result<Vec<SyncReport>> {
        self.store.load_reports(config_name, start, count)
    }

    pub fn check_presence(&self, _config_name: &str) -> (PresenceStatus, Vec<TransportKind>) {
        (PresenceStatus::Unknown, Vec::new())
    }

    pub fn publish_progress(&self, session_id: &str, detail: impl Into<String>) {
        let _ = self.signal_tx.send(Signal::Progress {
            session_id: session_id.to_string(),
            detail: detail.into(),
        });
    }

    pub fn publish_status(&self, session_id: &str, status: u16) {
        let _ = self.signal_tx.send(Signal::Status {
            session_id: session_id.to_string(),
            status,
        });
    }
}

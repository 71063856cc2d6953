//! Change Tracker (C1): persistent LUID -> revision mapping and change
//! detection.
//!
//! Mirrors the teacher's `get_changes`/`record_sync` pair, generalized
//! from a single `(revision, uuid)` scalar pair to a full per-item
//! revision map, and from a notmuch `lastmod:` query to a source-supplied
//! enumeration iterator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Local Unique Identifier: non-empty, stable for the item's lifetime.
///
/// Some sources expose a composite LUID `easid/subid` (a merged
/// server-side item plus a recurrence sub-component). The sentinel `//`
/// prefix on the persisted tracking key marks the composite scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Luid(pub String);

impl Luid {
    pub fn new(s: impl Into<String>) -> Self {
        Luid(s.into())
    }

    pub fn composite(easid: &str, subid: &str) -> Self {
        Luid(format!("{}/{}", easid, subid))
    }

    /// Splits `easid/subid` into its parts. Non-composite LUIDs return
    /// `(self, "")`.
    pub fn split_composite(&self) -> (&str, &str) {
        match self.0.split_once('/') {
            Some((easid, subid)) => (easid, subid),
            None => (&self.0, ""),
        }
    }

    pub fn is_composite(&self) -> bool {
        self.0.contains('/')
    }

    fn escape(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for b in s.bytes() {
            match b {
                b'%' | b'/' => out.push_str(&format!("%{:02X}", b)),
                // ASCII only: a byte >= 0x80 is a UTF-8 continuation byte,
                // not an independent scalar, so it must be escaped too
                // rather than reinterpreted via `b as char`.
                0x20..=0x7E => out.push(b as char),
                _ => out.push_str(&format!("%{:02X}", b)),
            }
        }
        out
    }

    fn unescape(s: &str) -> String {
        let bytes = s.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' && i + 2 < bytes.len() {
                if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(v);
                    i += 3;
                    continue;
                }
            }
            out.push(bytes[i]);
            i += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Persisted tracking-store key: `//<easid>/<subid>` for composite
    /// LUIDs (percent-escaping each part), or the plain escaped LUID
    /// otherwise.
    pub fn to_tracking_key(&self) -> String {
        if self.is_composite() {
            let (easid, subid) = self.split_composite();
            format!("//{}/{}", Self::escape(easid), Self::escape(subid))
        } else {
            Self::escape(&self.0)
        }
    }

    pub fn from_tracking_key(key: &str) -> Self {
        if let Some(rest) = key.strip_prefix("//") {
            let mut parts = rest.splitn(2, '/');
            let easid = parts.next().unwrap_or("");
            let subid = parts.next().unwrap_or("");
            Luid::composite(&Self::unescape(easid), &Self::unescape(subid))
        } else {
            Luid(Self::unescape(key))
        }
    }
}

impl std::fmt::Display for Luid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-item revision fingerprint. Never interpreted by the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision(pub String);

impl Revision {
    pub fn new(s: impl Into<String>) -> Self {
        Revision(s.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeState {
    New,
    Updated,
    Deleted,
    Unchanged,
}

/// For each active source, a partition of observed LUIDs.
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub new: Vec<Luid>,
    pub updated: Vec<Luid>,
    pub deleted: Vec<Luid>,
    pub unchanged: Vec<Luid>,
}

impl ChangeSet {
    /// Union of new+updated+deleted+unchanged, i.e. `ANY`.
    pub fn any(&self) -> impl Iterator<Item = &Luid> {
        self.new
            .iter()
            .chain(self.updated.iter())
            .chain(self.deleted.iter())
            .chain(self.unchanged.iter())
    }
}

/// Persistence backend for the revision map. A source's own storage
/// (SQLite row, flat file, in-memory test double, ...) backs this.
pub trait RevisionStore: Send + Sync {
    fn load(&mut self) -> Result<HashMap<Luid, Revision>>;
    fn flush(&mut self, entries: &HashMap<Luid, Revision>) -> Result<()>;
}

/// Reference `RevisionStore` backed by a single JSON file, written
/// atomically (temp file + rename) so a crash mid-flush can't corrupt
/// the tracking store -- the same crash-safety shape the teacher gets
/// for free from a single `fs::write` of one small file, generalized
/// here because the map can grow large enough that a torn write matters.
pub struct FileRevisionStore {
    path: PathBuf,
}

impl FileRevisionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileRevisionStore { path: path.into() }
    }
}

impl RevisionStore for FileRevisionStore {
    fn load(&mut self) -> Result<HashMap<Luid, Revision>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let raw: HashMap<String, String> = serde_json::from_str(&content)?;
                Ok(raw
                    .into_iter()
                    .map(|(k, v)| (Luid::from_tracking_key(&k), Revision::new(v)))
                    .collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self, entries: &HashMap<Luid, Revision>) -> Result<()> {
        let raw: HashMap<String, String> = entries
            .iter()
            .map(|(luid, rev)| (luid.to_tracking_key(), rev.0.clone()))
            .collect();
        let data = serde_json::to_vec_pretty(&raw)?;

        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Persistent LUID -> revision map and change detector for one source.
pub struct ChangeTracker {
    store: Box<dyn RevisionStore>,
    entries: HashMap<Luid, Revision>,
    last_write: Option<Instant>,
    granularity: Duration,
}

impl ChangeTracker {
    pub fn open(mut store: Box<dyn RevisionStore>, granularity: Duration) -> Result<Self> {
        let entries = store.load()?;
        Ok(ChangeTracker {
            store,
            entries,
            last_write: None,
            granularity,
        })
    }

    pub fn with_default_granularity(store: Box<dyn RevisionStore>) -> Result<Self> {
        Self::open(store, Duration::from_secs(1))
    }

    pub fn revision(&self, luid: &Luid) -> Option<&Revision> {
        self.entries.get(luid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Classifies each yielded `(luid, revision)` against the stored
    /// map, overwrites the stored revision, then removes and classifies
    /// as `Deleted` any stored LUID that was not yielded.
    ///
    /// Blocks until at least `granularity` has elapsed since the last
    /// locally driven write, so a remote-driven write within the same
    /// filesystem-mtime tick as the previous one can't be misclassified
    /// as unchanged on the next call (the debounce rule).
    pub async fn detect_changes<I>(&mut self, current: I) -> ChangeSet
    where
        I: IntoIterator<Item = (Luid, Revision)>,
    {
        self.debounce().await;

        let mut seen = std::collections::HashSet::new();
        let mut set = ChangeSet::default();

        for (luid, revision) in current {
            seen.insert(luid.clone());
            match self.entries.get(&luid) {
                None => set.new.push(luid.clone()),
                Some(old) if *old != revision => set.updated.push(luid.clone()),
                Some(_) => set.unchanged.push(luid.clone()),
            }
            self.entries.insert(luid, revision);
        }

        let deleted: Vec<Luid> = self
            .entries
            .keys()
            .filter(|l| !seen.contains(*l))
            .cloned()
            .collect();
        for luid in &deleted {
            self.entries.remove(luid);
        }
        set.deleted = deleted;

        set
    }

    async fn debounce(&self) {
        if let Some(last) = self.last_write {
            let elapsed = last.elapsed();
            if elapsed < self.granularity {
                tokio::time::sleep(self.granularity - elapsed).await;
            }
        }
    }

    /// Records the revision for an item just inserted/modified locally
    /// as a consequence of an incoming remote change.
    pub fn update_revision(&mut self, old_luid: Option<&Luid>, new_luid: Luid, revision: Revision) {
        if let Some(old) = old_luid {
            if old != &new_luid {
                self.entries.remove(old);
            }
        }
        self.entries.insert(new_luid, revision);
        self.last_write = Some(Instant::now());
    }

    /// Removes the entry after a local deletion driven by a remote change.
    pub fn delete_revision(&mut self, luid: &Luid) {
        self.entries.remove(luid);
        self.last_write = Some(Instant::now());
    }

    /// Persists the current map atomically. Callers must treat failure
    /// as fatal -- a partial flush would desynchronize the tracker from
    /// the store's true state.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush(&self.entries)
    }

    pub fn entries(&self) -> &HashMap<Luid, Revision> {
        &self.entries
    }
}

pub fn file_tracker(path: impl AsRef<Path>, granularity: Duration) -> Result<ChangeTracker> {
    ChangeTracker::open(Box::new(FileRevisionStore::new(path.as_ref())), granularity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    struct MemStore(StdHashMap<Luid, Revision>);

    impl RevisionStore for MemStore {
        fn load(&mut self) -> Result<StdHashMap<Luid, Revision>> {
            Ok(self.0.clone())
        }
        fn flush(&mut self, entries: &StdHashMap<Luid, Revision>) -> Result<()> {
            self.0 = entries.clone();
            Ok(())
        }
    }

    fn tracker() -> ChangeTracker {
        ChangeTracker::open(Box::new(MemStore(StdHashMap::new())), Duration::from_millis(0))
            .unwrap()
    }

    #[tokio::test]
    async fn first_sync_classifies_everything_new() {
        let mut t = tracker();
        let set = t
            .detect_changes(vec![
                (Luid::new("A"), Revision::new("r1")),
                (Luid::new("B"), Revision::new("r1")),
            ])
            .await;
        assert_eq!(set.new.len(), 2);
        assert!(set.updated.is_empty());
        assert!(set.deleted.is_empty());
        assert_eq!(t.len(), 2);
    }

    #[tokio::test]
    async fn incremental_sync_after_local_edit() {
        let mut t = tracker();
        t.detect_changes(vec![
            (Luid::new("A"), Revision::new("r1")),
            (Luid::new("B"), Revision::new("r1")),
        ])
        .await;

        let set = t
            .detect_changes(vec![
                (Luid::new("A"), Revision::new("r1")),
                (Luid::new("B"), Revision::new("r2")),
                (Luid::new("C"), Revision::new("r1")),
            ])
            .await;

        assert_eq!(set.unchanged, vec![Luid::new("A")]);
        assert_eq!(set.updated, vec![Luid::new("B")]);
        assert_eq!(set.new, vec![Luid::new("C")]);
        assert!(set.deleted.is_empty());

        assert_eq!(t.revision(&Luid::new("A")).unwrap(), &Revision::new("r1"));
        assert_eq!(t.revision(&Luid::new("B")).unwrap(), &Revision::new("r2"));
        assert_eq!(t.revision(&Luid::new("C")).unwrap(), &Revision::new("r1"));
    }

    #[tokio::test]
    async fn deletions_are_detected_and_removed() {
        let mut t = tracker();
        t.detect_changes(vec![(Luid::new("A"), Revision::new("r1"))])
            .await;
        let set = t.detect_changes(Vec::new()).await;
        assert_eq!(set.deleted, vec![Luid::new("A")]);
        assert!(t.is_empty());
    }

    #[test]
    fn partition_invariant() {
        // NEW, UPDATED, DELETED are pairwise disjoint by construction:
        // detect_changes only ever pushes a luid into exactly one bucket.
        let set = ChangeSet {
            new: vec![Luid::new("C")],
            updated: vec![Luid::new("B")],
            deleted: vec![],
            unchanged: vec![Luid::new("A")],
        };
        let mut all: Vec<_> = set.any().cloned().collect();
        all.sort();
        assert_eq!(all, vec![Luid::new("A"), Luid::new("B"), Luid::new("C")]);
    }

    #[test]
    fn composite_luid_round_trips_through_tracking_key() {
        let luid = Luid::composite("xyz-internal", "20240122T090000Z");
        let key = luid.to_tracking_key();
        assert!(key.starts_with("//"));
        assert_eq!(Luid::from_tracking_key(&key), luid);
    }

    #[test]
    fn non_ascii_luid_round_trips_through_tracking_key() {
        let luid = Luid::new("caf\u{e9}-\u{65e5}\u{672c}\u{8a9e}");
        let key = luid.to_tracking_key();
        assert_eq!(Luid::from_tracking_key(&key), luid);

        let composite = Luid::composite("caf\u{e9}", "\u{65e5}\u{672c}/sub");
        let key = composite.to_tracking_key();
        assert_eq!(Luid::from_tracking_key(&key), composite);
    }

    #[tokio::test]
    async fn file_revision_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracking.json");

        {
            let mut t = file_tracker(&path, Duration::from_millis(0)).unwrap();
            t.detect_changes(vec![(Luid::new("A"), Revision::new("r1"))])
                .await;
            t.flush().unwrap();
        }

        let t2 = file_tracker(&path, Duration::from_millis(0)).unwrap();
        assert_eq!(t2.revision(&Luid::new("A")).unwrap(), &Revision::new("r1"));
    }

    #[tokio::test]
    async fn debounce_blocks_until_granularity_elapsed() {
        let mut t = ChangeTracker::open(
            Box::new(MemStore(StdHashMap::new())),
            Duration::from_millis(50),
        )
        .unwrap();

        t.update_revision(None, Luid::new("A"), Revision::new("r1"));
        let start = Instant::now();
        t.detect_changes(vec![(Luid::new("A"), Revision::new("r1"))])
            .await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}

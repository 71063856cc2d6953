//! Sync Source (C2): the abstraction over a data store.
//!
//! Re-architected per the capability-mix-in note in SPEC_FULL.md `DESIGN
//! NOTES`: instead of one deep trait hierarchy, each capability is a
//! small trait, and `SyncSource` is a composition object holding
//! `Option<Box<dyn ...>>` for each one. The engine checks presence at
//! open time rather than relying on virtual dispatch through a common
//! base class.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};
use crate::tracker::{ChangeState, ChangeTracker, ChangeSet, Luid, Revision};

/// Native/forced/negotiated payload type for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mime {
    VCard21,
    VCard30,
    VCalendar10,
    ICalendar20,
    Note10,
    Note11,
}

#[derive(Debug, Clone)]
pub struct MimeNegotiation {
    pub native: Mime,
    pub forced: Option<Mime>,
    pub preferred: Mime,
    pub also_accepted: Vec<Mime>,
}

impl MimeNegotiation {
    /// The format to actually use: forced overrides native/preferred.
    pub fn effective(&self) -> Mime {
        self.forced.unwrap_or(self.native)
    }

    pub fn accepts(&self, mime: Mime) -> bool {
        mime == self.preferred || self.also_accepted.contains(&mime)
    }
}

#[async_trait]
pub trait SourceSession: Send + Sync {
    /// Opens the source for this run. `last_token` is the anchor from
    /// the previous successful sync (empty requests a slow sync);
    /// `resume_token` is set when resuming an interrupted session.
    async fn begin_sync(&self, last_token: Option<&str>, resume_token: Option<&str>) -> Result<()>;

    /// Closes the source and returns the anchor for the next sync.
    /// `success` tells the source whether to commit a new anchor at all.
    async fn end_sync(&self, success: bool) -> Result<Option<String>>;
}

#[async_trait]
pub trait SourceChanges: Send + Sync {
    async fn enumerate_changed(&self, filter: EnumerateFilter) -> Result<Vec<(Luid, ChangeState)>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerateFilter {
    New,
    Updated,
    Deleted,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertState {
    Okay,
    Merged,
    NeedsMerge,
}

#[derive(Debug, Clone)]
pub struct InsertResult {
    pub new_luid: Luid,
    pub state: InsertState,
}

#[async_trait]
pub trait SourceSerialize: Send + Sync {
    async fn read_item(&self, luid: &Luid) -> Result<Vec<u8>>;

    /// See SPEC_FULL.md §4.2 "Insert semantics" for the full composite-LUID
    /// merge contract implemented by `CompositeSource` below.
    async fn insert_item(&self, luid: Option<&Luid>, bytes: &[u8]) -> Result<InsertResult>;
}

#[async_trait]
pub trait SourceDelete: Send + Sync {
    async fn delete_item(&self, luid: &Luid) -> Result<()>;
}

#[async_trait]
pub trait SourceBackup: Send + Sync {
    async fn backup(&self, dir: &Path) -> Result<()>;
    async fn restore(&self, dir: &Path) -> Result<()>;
}

pub enum Described<'a> {
    Luid(&'a Luid),
    Bytes(&'a [u8]),
}

pub trait SourceLogging: Send + Sync {
    fn describe(&self, item: Described<'_>) -> String;
}

/// Composition object: holds whichever capabilities a concrete backend
/// implements. `session` is mandatory; every other capability is
/// optional and the caller must check presence before using it.
pub struct SyncSource {
    pub name: String,
    pub mime: MimeNegotiation,
    pub session: Box<dyn SourceSession>,
    pub changes: Option<Box<dyn SourceChanges>>,
    pub serialize: Option<Box<dyn SourceSerialize>>,
    pub delete: Option<Box<dyn SourceDelete>>,
    pub backup: Option<Box<dyn SourceBackup>>,
    pub logging: Option<Box<dyn SourceLogging>>,
}

impl SyncSource {
    pub fn describe(&self, item: Described<'_>) -> String {
        match &self.logging {
            Some(l) => l.describe(item),
            None => match item {
                Described::Luid(l) => l.to_string(),
                Described::Bytes(b) => format!("<{} bytes>", b.len()),
            },
        }
    }
}

/// Fallback content-hash revision for sources whose datastore lacks a
/// reliable mtime (SPEC_FULL.md §4.1 rationale).
pub fn content_revision(bytes: &[u8]) -> Revision {
    Revision::new(format!("{:x}", Sha256::digest(bytes)))
}

/// In-memory item store used by the test/reference sources.
#[derive(Debug, Clone, Default)]
pub struct ItemRecord {
    pub bytes: Vec<u8>,
    pub revision: Revision,
}

/// A simple, non-composite reference source backed by an in-memory map.
/// Used by the engine/session/driver-loop tests; a real backend (address
/// book, calendar database, WebDAV) is out of scope per SPEC_FULL.md §1.
pub struct MemorySource {
    pub items: std::sync::Mutex<HashMap<Luid, ItemRecord>>,
    pub tracker: tokio::sync::Mutex<ChangeTracker>,
    pub anchor: std::sync::Mutex<Option<String>>,
}

impl MemorySource {
    pub fn new(tracker: ChangeTracker) -> Self {
        MemorySource {
            items: std::sync::Mutex::new(HashMap::new()),
            tracker: tokio::sync::Mutex::new(tracker),
            anchor: std::sync::Mutex::new(None),
        }
    }

    pub fn insert_raw(&self, luid: Luid, bytes: Vec<u8>) {
        let revision = content_revision(&bytes);
        self.items
            .lock()
            .unwrap()
            .insert(luid, ItemRecord { bytes, revision });
    }

    /// Runs change detection against the current in-memory contents.
    pub async fn detect_changes(&self) -> ChangeSet {
        let current: Vec<(Luid, Revision)> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .map(|(l, r)| (l.clone(), r.revision.clone()))
            .collect();
        self.tracker.lock().await.detect_changes(current).await
    }
}

#[async_trait]
impl SourceSession for MemorySource {
    async fn begin_sync(&self, last_token: Option<&str>, _resume_token: Option<&str>) -> Result<()> {
        *self.anchor.lock().unwrap() = last_token.map(|s| s.to_string());
        Ok(())
    }

    async fn end_sync(&self, success: bool) -> Result<Option<String>> {
        if !success {
            return Ok(self.anchor.lock().unwrap().clone());
        }
        self.tracker.lock().await.flush()?;
        Ok(Some(format!("anchor-{}", self.items.lock().unwrap().len())))
    }
}

#[async_trait]
impl SourceChanges for MemorySource {
    async fn enumerate_changed(&self, filter: EnumerateFilter) -> Result<Vec<(Luid, ChangeState)>> {
        let set = self.detect_changes().await;
        let mut out = Vec::new();
        let push = |out: &mut Vec<(Luid, ChangeState)>, luids: &[Luid], state: ChangeState| {
            out.extend(luids.iter().cloned().map(|l| (l, state)));
        };
        match filter {
            EnumerateFilter::New => push(&mut out, &set.new, ChangeState::New),
            EnumerateFilter::Updated => push(&mut out, &set.updated, ChangeState::Updated),
            EnumerateFilter::Deleted => push(&mut out, &set.deleted, ChangeState::Deleted),
            EnumerateFilter::Any => {
                push(&mut out, &set.new, ChangeState::New);
                push(&mut out, &set.updated, ChangeState::Updated);
                push(&mut out, &set.deleted, ChangeState::Deleted);
                push(&mut out, &set.unchanged, ChangeState::Unchanged);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceSerialize for MemorySource {
    async fn read_item(&self, luid: &Luid) -> Result<Vec<u8>> {
        self.items
            .lock()
            .unwrap()
            .get(luid)
            .map(|r| r.bytes.clone())
            .ok_or_else(|| SyncError::datastore("memory", format!("not found: {luid}")))
    }

    async fn insert_item(&self, luid: Option<&Luid>, bytes: &[u8]) -> Result<InsertResult> {
        let new_luid = match luid {
            Some(l) if !l.0.is_empty() => l.clone(),
            _ => Luid::new(format!("item-{}", self.items.lock().unwrap().len())),
        };
        self.insert_raw(new_luid.clone(), bytes.to_vec());
        let revision = content_revision(bytes);
        self.tracker
            .lock()
            .await
            .update_revision(None, new_luid.clone(), revision);
        Ok(InsertResult {
            new_luid,
            state: InsertState::Okay,
        })
    }
}

#[async_trait]
impl SourceDelete for MemorySource {
    async fn delete_item(&self, luid: &Luid) -> Result<()> {
        self.items.lock().unwrap().remove(luid);
        self.tracker.lock().await.delete_revision(luid);
        Ok(())
    }
}

/// Thin adaptor letting one `Arc<MemorySource>` back every capability
/// trait object a `SyncSource` composition needs.
struct MemorySourceHandle(std::sync::Arc<MemorySource>);

#[async_trait]
impl SourceSession for MemorySourceHandle {
    async fn begin_sync(&self, last_token: Option<&str>, resume_token: Option<&str>) -> Result<()> {
        self.0.begin_sync(last_token, resume_token).await
    }
    async fn end_sync(&self, success: bool) -> Result<Option<String>> {
        self.0.end_sync(success).await
    }
}

#[async_trait]
impl SourceChanges for MemorySourceHandle {
    async fn enumerate_changed(&self, filter: EnumerateFilter) -> Result<Vec<(Luid, ChangeState)>> {
        self.0.enumerate_changed(filter).await
    }
}

#[async_trait]
impl SourceSerialize for MemorySourceHandle {
    async fn read_item(&self, luid: &Luid) -> Result<Vec<u8>> {
        self.0.read_item(luid).await
    }
    async fn insert_item(&self, luid: Option<&Luid>, bytes: &[u8]) -> Result<InsertResult> {
        self.0.insert_item(luid, bytes).await
    }
}

#[async_trait]
impl SourceDelete for MemorySourceHandle {
    async fn delete_item(&self, luid: &Luid) -> Result<()> {
        self.0.delete_item(luid).await
    }
}

/// Builds a fully-capable `SyncSource` over a fresh `MemorySource`, for
/// callers -- tests, the reference CLI -- that just need a working
/// in-memory datastore rather than a real backend (out of scope per
/// SPEC_FULL.md §1).
pub fn memory_sync_source(
    name: impl Into<String>,
    mime: MimeNegotiation,
    tracker: ChangeTracker,
) -> std::sync::Arc<SyncSource> {
    let mem = std::sync::Arc::new(MemorySource::new(tracker));
    std::sync::Arc::new(SyncSource {
        name: name.into(),
        mime,
        session: Box::new(MemorySourceHandle(mem.clone())),
        changes: Some(Box::new(MemorySourceHandle(mem.clone()))),
        serialize: Some(Box::new(MemorySourceHandle(mem.clone()))),
        delete: Some(Box::new(MemorySourceHandle(mem.clone()))),
        backup: None,
        logging: None,
    })
}

/// Minimal vCalendar-like byte payload used by `CompositeSource`'s tests:
/// `UID:<uid>\nRECURRENCE-ID:<rid>\n...`. The core never parses real
/// iCalendar content (SPEC_FULL.md §1 non-goals); this is just enough
/// structure to exercise the merge contract.
fn extract_field(bytes: &[u8], field: &str) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            return Some(rest.trim_start_matches(':').trim().to_string());
        }
    }
    None
}

/// Reconstructs a sub-component's `RECURRENCE-ID` from its own `DTSTART`
/// using the parent's time zone (SPEC_FULL.md §4.2): the digits come from
/// the occurrence's own start time, the UTC marker from the parent's.
fn reconstruct_recurrence_id(own_dtstart: &str, parent_dtstart: &str) -> String {
    let own_digits = own_dtstart.trim_end_matches('Z');
    if parent_dtstart.ends_with('Z') {
        format!("{own_digits}Z")
    } else {
        own_digits.to_string()
    }
}

/// Rewrites the `UID:` line of a synthetic item payload, used when a
/// sub-component is inserted with a UID that doesn't match its parent's.
fn rewrite_uid_field(bytes: &[u8], canonical_uid: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::new();
    for line in text.lines() {
        if line.strip_prefix("UID").is_some() {
            out.push_str("UID:");
            out.push_str(canonical_uid);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out.into_bytes()
}

/// Reference source for the composite-LUID (`easid/subid`) contract in
/// SPEC_FULL.md §4.2: a merged parent ("meeting series") holding one or
/// more sub-components identified by `RECURRENCE-ID`.
pub struct CompositeSource {
    /// uid -> easid (the parent item's internal id)
    parents: std::sync::Mutex<HashMap<String, String>>,
    /// easid -> the canonical UID every sub-component must carry.
    canonical_uid: std::sync::Mutex<HashMap<String, String>>,
    /// easid -> the master item's DTSTART, used to reconstruct a missing
    /// RECURRENCE-ID's time zone for later sub-components.
    parent_dtstart: std::sync::Mutex<HashMap<String, String>>,
    items: std::sync::Mutex<HashMap<Luid, ItemRecord>>,
    tracker: tokio::sync::Mutex<ChangeTracker>,
    next_id: std::sync::atomic::AtomicU64,
}

impl CompositeSource {
    pub fn new(tracker: ChangeTracker) -> Self {
        CompositeSource {
            parents: std::sync::Mutex::new(HashMap::new()),
            canonical_uid: std::sync::Mutex::new(HashMap::new()),
            parent_dtstart: std::sync::Mutex::new(HashMap::new()),
            items: std::sync::Mutex::new(HashMap::new()),
            tracker: tokio::sync::Mutex::new(tracker),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn parent_for_uid(&self, uid: &str) -> Option<String> {
        self.parents.lock().unwrap().get(uid).cloned()
    }
}

#[async_trait]
impl SourceSession for CompositeSource {
    async fn begin_sync(&self, _last_token: Option<&str>, _resume_token: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn end_sync(&self, success: bool) -> Result<Option<String>> {
        if success {
            self.tracker.lock().await.flush()?;
        }
        Ok(Some("composite-anchor".to_string()))
    }
}

#[async_trait]
impl SourceSerialize for CompositeSource {
    async fn read_item(&self, luid: &Luid) -> Result<Vec<u8>> {
        self.items
            .lock()
            .unwrap()
            .get(luid)
            .map(|r| r.bytes.clone())
            .ok_or_else(|| SyncError::datastore("composite", format!("not found: {luid}")))
    }

    async fn insert_item(&self, caller_luid: Option<&Luid>, bytes: &[u8]) -> Result<InsertResult> {
        let content_uid = extract_field(bytes, "UID")
            .ok_or_else(|| SyncError::datastore("composite", "missing UID"))?;
        let mut rid = extract_field(bytes, "RECURRENCE-ID");
        let own_dtstart = extract_field(bytes, "DTSTART");

        let existing_parent_by_uid = self.parent_for_uid(&content_uid);
        let caller_easid = caller_luid.map(|l| l.split_composite().0.to_string());
        let caller_is_known_parent = caller_easid
            .as_ref()
            .map(|e| self.canonical_uid.lock().unwrap().contains_key(e))
            .unwrap_or(false);

        // The caller named one parent but the content UID already belongs
        // to a different, real parent: the engine's view is stale and
        // needs a merge cycle before this insert can proceed.
        if let (Some(by_uid), Some(caller)) = (&existing_parent_by_uid, &caller_easid) {
            if by_uid != caller {
                let subid = rid.clone().unwrap_or_default();
                let actual = Luid::composite(by_uid, &subid);
                return Ok(InsertResult {
                    new_luid: actual,
                    state: InsertState::NeedsMerge,
                });
            }
        }

        let existing_parent = existing_parent_by_uid.or(if caller_is_known_parent {
            caller_easid
        } else {
            None
        });

        let easid = match existing_parent {
            Some(p) => p,
            None => {
                let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let easid = format!("{}-internal", id);
                self.parents.lock().unwrap().insert(content_uid.clone(), easid.clone());
                easid
            }
        };

        let is_first_for_parent = !self
            .items
            .lock()
            .unwrap()
            .keys()
            .any(|l| l.split_composite().0 == easid);

        if is_first_for_parent {
            self.canonical_uid
                .lock()
                .unwrap()
                .insert(easid.clone(), content_uid.clone());
            if let Some(ds) = &own_dtstart {
                self.parent_dtstart.lock().unwrap().insert(easid.clone(), ds.clone());
            }
        } else if rid.is_none() {
            // Caller matched the parent but gave no RECURRENCE-ID: if the
            // parent has its own DTSTART and this occurrence carries one
            // too, reconstruct the id from the occurrence's start time in
            // the parent's time zone (SPEC_FULL.md §4.2).
            let parent_ds = self.parent_dtstart.lock().unwrap().get(&easid).cloned();
            if let (Some(parent_ds), Some(own_ds)) = (parent_ds, &own_dtstart) {
                rid = Some(reconstruct_recurrence_id(own_ds, &parent_ds));
            }
        }

        // A sub-component's UID must equal the parent's; a mismatching
        // caller-supplied UID is overwritten before storing.
        let canonical_uid = self
            .canonical_uid
            .lock()
            .unwrap()
            .get(&easid)
            .cloned()
            .unwrap_or_else(|| content_uid.clone());
        let stored_bytes = if canonical_uid != content_uid {
            rewrite_uid_field(bytes, &canonical_uid)
        } else {
            bytes.to_vec()
        };

        let subid = rid.unwrap_or_default();
        let new_luid = Luid::composite(&easid, &subid);
        let revision = content_revision(&stored_bytes);

        self.items.lock().unwrap().insert(
            new_luid.clone(),
            ItemRecord {
                bytes: stored_bytes,
                revision: revision.clone(),
            },
        );
        self.tracker
            .lock()
            .await
            .update_revision(None, new_luid.clone(), revision);

        Ok(InsertResult {
            new_luid,
            state: if is_first_for_parent {
                InsertState::Okay
            } else {
                InsertState::Merged
            },
        })
    }
}

#[async_trait]
impl SourceDelete for CompositeSource {
    /// Deletes the only sub-id of a composite item by removing the whole
    /// parent; otherwise removes just the sub-component.
    async fn delete_item(&self, luid: &Luid) -> Result<()> {
        let (easid, _subid) = luid.split_composite();
        let siblings: Vec<Luid> = self
            .items
            .lock()
            .unwrap()
            .keys()
            .filter(|l| l.split_composite().0 == easid)
            .cloned()
            .collect();

        if siblings.len() <= 1 {
            for sibling in &siblings {
                self.items.lock().unwrap().remove(sibling);
                self.tracker.lock().await.delete_revision(sibling);
            }
            self.parents.lock().unwrap().retain(|_, v| v != easid);
        } else {
            self.items.lock().unwrap().remove(luid);
            self.tracker.lock().await.delete_revision(luid);
        }
        Ok(())
    }
}

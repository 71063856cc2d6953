//! End-to-end driver-loop scenarios (SPEC_FULL.md §8), wiring
//! `SessionController` + `SimEngine` + `StreamTransport` over an
//! in-memory duplex pipe -- the `tokio::io::duplex` pattern the teacher
//! uses in `sync_local_with_streams`/`sync_remote_with_streams` to swap
//! a real subprocess for a pipe in tests.
//!
//! Scenario 3 (composite MERGED insert) and scenario 5 (revision
//! granularity debounce) exercise `ChangeTracker`/`CompositeSource`
//! directly and already have realistic coverage as unit tests in
//! `tracker.rs` and `source.rs`; scenario 6 (empty-token retry) is a
//! pure function of `get_items_with_retry` and is covered in
//! `engine.rs`. This file covers the scenarios that specifically need a
//! full two-party driver loop: 1, 2, and 4.

use std::collections::HashMap;
use std::time::Duration;

use syncevo_core::engine::Role;
use syncevo_core::report::{ItemState, Location, Outcome};
use syncevo_core::session::{SessionController, SourceEntry, SyncMode};
use syncevo_core::source::{memory_sync_source, Mime, MimeNegotiation};
use syncevo_core::source::{
    EnumerateFilter, InsertResult, MemorySource, SourceChanges, SourceDelete, SourceSerialize,
    SourceSession, SyncSource,
};
use syncevo_core::tracker::{ChangeState, ChangeTracker, Luid, Revision, RevisionStore};
use syncevo_core::transport::StreamTransport;
use syncevo_core::Result;

/// Thin adaptor exposing a shared `Arc<MemorySource>` as every capability
/// a `SyncSource` needs, letting the test keep its own handle to call
/// `insert_raw` (a genuine local edit that bypasses the tracker, unlike
/// `insert_item` which is the remote-apply path).
struct Shared(std::sync::Arc<MemorySource>);

#[async_trait::async_trait]
impl SourceSession for Shared {
    async fn begin_sync(&self, last_token: Option<&str>, resume_token: Option<&str>) -> Result<()> {
        self.0.begin_sync(last_token, resume_token).await
    }
    async fn end_sync(&self, success: bool) -> Result<Option<String>> {
        self.0.end_sync(success).await
    }
}
#[async_trait::async_trait]
impl SourceChanges for Shared {
    async fn enumerate_changed(&self, filter: EnumerateFilter) -> Result<Vec<(Luid, ChangeState)>> {
        self.0.enumerate_changed(filter).await
    }
}
#[async_trait::async_trait]
impl SourceSerialize for Shared {
    async fn read_item(&self, luid: &Luid) -> Result<Vec<u8>> {
        self.0.read_item(luid).await
    }
    async fn insert_item(&self, luid: Option<&Luid>, bytes: &[u8]) -> Result<InsertResult> {
        self.0.insert_item(luid, bytes).await
    }
}
#[async_trait::async_trait]
impl SourceDelete for Shared {
    async fn delete_item(&self, luid: &Luid) -> Result<()> {
        self.0.delete_item(luid).await
    }
}

fn shared_sync_source(mem: std::sync::Arc<MemorySource>) -> std::sync::Arc<SyncSource> {
    std::sync::Arc::new(SyncSource {
        name: "contacts".to_string(),
        mime: vcard_mime(),
        session: Box::new(Shared(mem.clone())),
        changes: Some(Box::new(Shared(mem.clone()))),
        serialize: Some(Box::new(Shared(mem.clone()))),
        delete: Some(Box::new(Shared(mem.clone()))),
        backup: None,
        logging: None,
    })
}

struct MemRevisions(HashMap<Luid, Revision>);

impl RevisionStore for MemRevisions {
    fn load(&mut self) -> Result<HashMap<Luid, Revision>> {
        Ok(self.0.clone())
    }
    fn flush(&mut self, entries: &HashMap<Luid, Revision>) -> Result<()> {
        self.0 = entries.clone();
        Ok(())
    }
}

fn tracker_over(store: HashMap<Luid, Revision>) -> ChangeTracker {
    ChangeTracker::open(Box::new(MemRevisions(store)), Duration::from_millis(0)).unwrap()
}

fn vcard_mime() -> MimeNegotiation {
    MimeNegotiation {
        native: Mime::VCard30,
        forced: None,
        preferred: Mime::VCard30,
        also_accepted: vec![],
    }
}

fn entry(name: &str, mode: SyncMode, source: std::sync::Arc<syncevo_core::source::SyncSource>, last_anchor: Option<String>) -> SourceEntry {
    SourceEntry {
        name: name.to_string(),
        source,
        mode,
        remote_uri: "card".to_string(),
        explicit_password: Some("secret".to_string()),
        persisted_password: None,
        last_anchor,
        resume_token: None,
        backup_requested: false,
    }
}

/// Scenario 1: first sync, two items. A fresh tracker enumerates `{A, B}`
/// as unchanged (they were inserted directly, which already records
/// their revisions), so the first-time-slow alert resends them as a
/// baseline rather than as ADDED changes, and the tracker ends up
/// holding exactly `{A, B}`.
#[tokio::test]
async fn scenario_1_first_sync_two_items() {
    let client_source = memory_sync_source("contacts", vcard_mime(), tracker_over(HashMap::new()));
    if let Some(serialize) = client_source.serialize.as_ref() {
        serialize.insert_item(Some(&Luid::new("A")), b"vcard-a").await.unwrap();
        serialize.insert_item(Some(&Luid::new("B")), b"vcard-b").await.unwrap();
    }
    let server_source = memory_sync_source("contacts", vcard_mime(), tracker_over(HashMap::new()));

    let (client_r, server_w) = tokio::io::duplex(65536);
    let (server_r, client_w) = tokio::io::duplex(65536);
    let mut client_transport = StreamTransport::new(client_r, client_w);
    let mut server_transport = StreamTransport::new(server_r, server_w);

    let mut client_session = SessionController::new("sess-e2e-1");
    let mut server_session = SessionController::new("sess-e2e-1-remote");

    let client_entry = entry("contacts", SyncMode::TwoWay, client_source, None);
    let server_entry = entry("contacts", SyncMode::TwoWay, server_source, None);

    let client_fut = client_session.run(Role::Client, vec![client_entry], &mut client_transport);
    let server_fut = server_session.run(Role::Server, vec![server_entry], &mut server_transport);
    let (client_report, server_report) = tokio::join!(client_fut, server_fut);
    let client_report = client_report.unwrap();
    let server_report = server_report.unwrap();

    assert_eq!(client_report.status, 200);
    assert_eq!(server_report.status, 200);

    let contacts = &client_report.sources["contacts"];
    assert_eq!(contacts.get(Location::Local, ItemState::Added, Outcome::Total), 0);
    assert!(contacts.get(Location::Local, ItemState::Any, Outcome::SentBytes) > 0);
    assert_eq!(contacts.get(Location::Local, ItemState::Any, Outcome::Match), 2);
}

/// Scenario 2: incremental sync after a local edit. Session 1 establishes
/// a baseline of `{A, B}` and yields a non-empty anchor; between sessions
/// `B` is edited and `C` is added locally; session 2 (now a normal,
/// non-forced two-way sync) reports exactly one ADDED and one UPDATED.
#[tokio::test]
async fn scenario_2_incremental_sync_after_local_edit() {
    let client_mem = std::sync::Arc::new(MemorySource::new(tracker_over(HashMap::new())));
    client_mem.insert_raw(Luid::new("A"), b"vcard-a".to_vec());
    client_mem.insert_raw(Luid::new("B"), b"vcard-b".to_vec());
    let client_source = shared_sync_source(client_mem.clone());

    let run_session = |client_source: std::sync::Arc<SyncSource>, last_anchor: Option<String>| async move {
        let server_source = memory_sync_source("contacts", vcard_mime(), tracker_over(HashMap::new()));
        let (client_r, server_w) = tokio::io::duplex(65536);
        let (server_r, client_w) = tokio::io::duplex(65536);
        let mut client_transport = StreamTransport::new(client_r, client_w);
        let mut server_transport = StreamTransport::new(server_r, server_w);

        let mut client_session = SessionController::new("sess-e2e-2");
        let mut server_session = SessionController::new("sess-e2e-2-remote");
        let client_entry = entry("contacts", SyncMode::TwoWay, client_source, last_anchor);
        let server_entry = entry("contacts", SyncMode::TwoWay, server_source, None);

        let client_fut = client_session.run(Role::Client, vec![client_entry], &mut client_transport);
        let server_fut = server_session.run(Role::Server, vec![server_entry], &mut server_transport);
        let (client_report, _server_report) = tokio::join!(client_fut, server_fut);
        client_report.unwrap()
    };

    let first = run_session(client_source.clone(), None).await;
    assert_eq!(first.status, 200);

    // Session 1's baseline sync classified A and B as NEW (the tracker
    // started empty and insert_raw never touches it), so after it the
    // tracker holds exactly {A, B}.
    let anchor = client_mem.end_sync(true).await.unwrap();
    assert!(!anchor.as_deref().unwrap_or("").is_empty());

    // A genuine local edit: insert_raw only touches the item store, so
    // the next enumeration sees B's new content against its old revision.
    client_mem.insert_raw(Luid::new("B"), b"vcard-b-edited".to_vec());
    client_mem.insert_raw(Luid::new("C"), b"vcard-c".to_vec());

    let second = run_session(client_source.clone(), anchor).await;
    assert_eq!(second.status, 200);

    let contacts = &second.sources["contacts"];
    assert_eq!(contacts.get(Location::Local, ItemState::Added, Outcome::Total), 1);
    assert_eq!(contacts.get(Location::Local, ItemState::Updated, Outcome::Total), 1);
}

/// Scenario 4: abort during wait. Aborting before the driver loop starts
/// forces the very first step to `ABORT`, so the engine never blocks on
/// the transport at all (the transport here has no peer on the other
/// end, so any non-aborted path would hang forever) -- the session still
/// calls `sync_end` for the opened source and leaves its tracker
/// untouched.
#[tokio::test]
async fn scenario_4_abort_yields_non_ok_status_without_hanging() {
    let client_source = memory_sync_source("contacts", vcard_mime(), tracker_over(HashMap::new()));
    if let Some(serialize) = client_source.serialize.as_ref() {
        serialize.insert_item(Some(&Luid::new("A")), b"vcard-a").await.unwrap();
    }

    // No peer reads the other end of this pipe; a non-aborted driver loop
    // would block forever in NEED_DATA.
    let (client_r, _unread_w) = tokio::io::duplex(65536);
    let (_unread_r, client_w) = tokio::io::duplex(65536);
    let mut client_transport = StreamTransport::new(client_r, client_w);

    let mut client_session = SessionController::new("sess-e2e-4");
    client_session.abort();

    let client_entry = entry("contacts", SyncMode::TwoWay, client_source.clone(), None);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        client_session.run(Role::Client, vec![client_entry], &mut client_transport),
    )
    .await
    .expect("driver loop must not hang once abort is requested")
    .unwrap();

    assert_ne!(report.status, 200);
    assert!(client_source.session.end_sync(true).await.unwrap().is_some());
}

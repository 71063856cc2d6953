//! Session Controller (C5): one end-to-end sync run for one configuration.
//!
//! Lifecycle mirrors SPEC_FULL.md §4.5: `prepare()` hook, logging
//! directory + pre-sync snapshot, per-source credential resolution and
//! open, per-source driver loop (one `ProtocolEngine` instance per
//! target, since `SimEngine::bind` is single-target), then report
//! assembly, post-sync snapshot, and log rotation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::{
    run_driver_loop, Direction, ProgressEvent, ProtocolEngine, Role, SessionControl, SimEngine,
    TargetConfig,
};
use crate::error::{Result, SyncError};
use crate::logging::{SessionLog, SnapshotWhen};
use crate::report::{SourceReport, SyncReport};
use crate::source::SyncSource;
use crate::transport::TransportAgent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    TwoWay,
    Slow,
    RefreshFromServer,
    RefreshFromClient,
    OneWayFromServer,
    OneWayFromClient,
    Disabled,
}

impl SyncMode {
    /// Mode-to-engine translation table, SPEC_FULL.md §4.5, verbatim.
    pub fn to_engine_params(self) -> (bool, Direction) {
        match self {
            SyncMode::TwoWay => (false, Direction::Both),
            SyncMode::Slow => (true, Direction::Both),
            SyncMode::OneWayFromServer => (false, Direction::FromServer),
            SyncMode::OneWayFromClient => (false, Direction::FromClient),
            SyncMode::RefreshFromServer => (true, Direction::FromServer),
            SyncMode::RefreshFromClient => (true, Direction::FromClient),
            SyncMode::Disabled => (false, Direction::Both),
        }
    }
}

/// Credential resolution order (SPEC_FULL.md §4.5): explicit session
/// value -> persisted configuration -> interactive prompt. The core
/// itself never prompts; a CLI/IPC front-end supplies a provider that
/// does, via this trait.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(
        &self,
        source_name: &str,
        explicit: Option<&str>,
        persisted: Option<&str>,
    ) -> Result<Option<String>>;
}

/// Non-interactive reference provider: explicit, then persisted, then
/// gives up (no prompt).
pub struct NonInteractiveCredentials;

#[async_trait]
impl CredentialProvider for NonInteractiveCredentials {
    async fn resolve(
        &self,
        _source_name: &str,
        explicit: Option<&str>,
        persisted: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(explicit.map(String::from).or_else(|| persisted.map(String::from)))
    }
}

/// Virtual `prepare()` hook (SPEC_FULL.md §4.5 step 1), allowing a
/// caller to override configuration before the session starts.
pub trait SessionHooks: Send + Sync {
    fn prepare(&self) {}
}

pub struct DefaultHooks;
impl SessionHooks for DefaultHooks {}

pub struct SourceEntry {
    pub name: String,
    pub source: Arc<SyncSource>,
    pub mode: SyncMode,
    pub remote_uri: String,
    pub explicit_password: Option<String>,
    pub persisted_password: Option<String>,
    pub last_anchor: Option<String>,
    pub resume_token: Option<String>,
    pub backup_requested: bool,
}

pub struct SessionController {
    pub session_id: String,
    pub control: Arc<SessionControl>,
    pub hooks: Box<dyn SessionHooks>,
    pub credentials: Box<dyn CredentialProvider>,
    pub log: Option<SessionLog>,
}

impl SessionController {
    pub fn new(session_id: impl Into<String>) -> Self {
        SessionController {
            session_id: session_id.into(),
            control: Arc::new(SessionControl::new()),
            hooks: Box::new(DefaultHooks),
            credentials: Box::new(NonInteractiveCredentials),
            log: None,
        }
    }

    pub fn with_log(mut self, log: SessionLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn abort(&self) {
        self.control.abort();
    }

    pub fn suspend(&self) {
        self.control.suspend();
    }

    /// Runs the full session: credential resolution and open for every
    /// enabled source, then one driver loop per source against `transport`.
    ///
    /// A missing password for an enabled source is fatal *before* the
    /// driver loop starts (SPEC_FULL.md §4.5); once running, a per-source
    /// failure is captured in that source's report and does not abort
    /// its siblings (SPEC_FULL.md §7).
    pub async fn run(
        &mut self,
        role: Role,
        mut sources: Vec<SourceEntry>,
        transport: &mut dyn TransportAgent,
    ) -> Result<SyncReport> {
        self.hooks.prepare();

        let mut resolved_passwords = HashMap::new();
        for entry in sources.iter().filter(|e| e.mode != SyncMode::Disabled) {
            let password = self
                .credentials
                .resolve(
                    &entry.name,
                    entry.explicit_password.as_deref(),
                    entry.persisted_password.as_deref(),
                )
                .await?;
            let password = password.ok_or_else(|| {
                SyncError::Credentials(format!("missing password for source '{}'", entry.name))
            })?;
            resolved_passwords.insert(entry.name.clone(), password);
        }

        if let Some(log) = &self.log {
            for entry in sources.iter().filter(|e| e.mode != SyncMode::Disabled) {
                if entry.backup_requested {
                    if let Some(backup) = &entry.source.backup {
                        let dir = log.dir().join(format!("{}.backup", entry.name));
                        backup
                            .backup(&dir)
                            .await
                            .map_err(|e| SyncError::datastore(&entry.name, e.to_string()))?;
                    }
                }
            }
        }

        let mut report = SyncReport::new(self.session_id.clone());

        for entry in sources.drain(..) {
            if entry.mode == SyncMode::Disabled {
                continue;
            }

            let (source_report, new_anchor) = self.run_one_source(role, &entry, transport).await;
            if let Some(anchor) = new_anchor {
                report.anchors.insert(entry.name.clone(), anchor);
            }
            report.sources.insert(entry.name.clone(), source_report);
        }

        report.finalize_status();
        Ok(report)
    }

    async fn run_one_source(
        &self,
        role: Role,
        entry: &SourceEntry,
        transport: &mut dyn TransportAgent,
    ) -> (SourceReport, Option<String>) {
        let mut source_report = SourceReport::default();

        if let Err(e) = entry
            .source
            .session
            .begin_sync(entry.last_anchor.as_deref(), entry.resume_token.as_deref())
            .await
        {
            source_report.status = 500;
            log::warn!("source '{}' failed to open: {e}", entry.name);
            return (source_report, None);
        }

        if let Some(log) = &self.log {
            let before = match &entry.source.changes {
                Some(changes) => changes
                    .enumerate_changed(crate::source::EnumerateFilter::Any)
                    .await
                    .map(|items| items.len())
                    .unwrap_or(0),
                None => 0,
            };
            let _ = log.write_snapshot(
                &entry.name,
                SnapshotWhen::Before,
                "txt",
                format!("{before} items").as_bytes(),
            );
        }

        let (force_slow, direction) = entry.mode.to_engine_params();
        let mut engine = SimEngine::new(role);
        engine.bind(
            entry.source.clone(),
            entry.last_anchor.clone(),
            entry.resume_token.clone(),
        );
        engine.set_target_values(
            &entry.name,
            TargetConfig {
                name: entry.name.clone(),
                remote_uri: entry.remote_uri.clone(),
                force_slow,
                direction,
            },
        );

        let driver_result = run_driver_loop(&mut engine, transport, &self.control).await;

        let success = driver_result.is_ok()
            && !self.control.abort_requested()
            && !self.control.suspend_requested();

        match driver_result {
            Ok(events) => {
                for event in &events {
                    if let ProgressEvent::DsStats(stats) = event {
                        source_report.record_ds_stats(stats);
                    }
                }
            }
            Err(e) => {
                log::warn!("source '{}' driver loop failed: {e}", entry.name);
            }
        }

        let mut new_anchor = None;
        match entry.source.session.end_sync(success).await {
            Ok(anchor) => {
                // Invariant 5 (SPEC_FULL.md §8): a session that completes
                // OK must leave a non-empty anchor for the next incremental.
                source_report.status = if success && anchor.as_deref().unwrap_or("").is_empty() {
                    500
                } else if success {
                    200
                } else if self.control.suspend_requested() {
                    506
                } else if self.control.abort_requested() {
                    507
                } else {
                    500
                };
                if success {
                    new_anchor = anchor.filter(|a| !a.is_empty());
                }
            }
            Err(e) => {
                log::warn!("source '{}' failed to close: {e}", entry.name);
                source_report.status = 500;
            }
        }

        if let Some(log) = &self.log {
            let _ = log.write_snapshot(
                &entry.name,
                SnapshotWhen::After,
                "json",
                format!("{:?}", source_report.counters).as_bytes(),
            );
        }

        (source_report, new_anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{memory_sync_source, Mime, MimeNegotiation};
    use crate::tracker::{ChangeTracker, Luid, Revision, RevisionStore};
    use crate::transport::StreamTransport;
    use std::collections::HashMap as StdMap;
    use std::time::Duration;

    struct Null(StdMap<Luid, Revision>);
    impl RevisionStore for Null {
        fn load(&mut self) -> Result<StdMap<Luid, Revision>> {
            Ok(self.0.clone())
        }
        fn flush(&mut self, entries: &StdMap<Luid, Revision>) -> Result<()> {
            self.0 = entries.clone();
            Ok(())
        }
    }

    fn tracker() -> ChangeTracker {
        ChangeTracker::open(Box::new(Null(StdMap::new())), Duration::from_millis(0)).unwrap()
    }

    fn vcard_mime() -> MimeNegotiation {
        MimeNegotiation {
            native: Mime::VCard30,
            forced: None,
            preferred: Mime::VCard30,
            also_accepted: vec![],
        }
    }

    #[tokio::test]
    async fn first_sync_two_items_ends_ok_with_nonempty_anchor() {
        let client_source = memory_sync_source("contacts", vcard_mime(), tracker());
        if let Some(mem) = client_source.serialize.as_ref() {
            mem.insert_item(Some(&Luid::new("A")), b"vcard-a").await.unwrap();
            mem.insert_item(Some(&Luid::new("B")), b"vcard-b").await.unwrap();
        }

        let server_source = memory_sync_source("contacts", vcard_mime(), tracker());

        let (client_pipe_r, server_pipe_w) = tokio::io::duplex(65536);
        let (server_pipe_r, client_pipe_w) = tokio::io::duplex(65536);

        let mut client_transport = StreamTransport::new(client_pipe_r, client_pipe_w);
        let mut server_transport = StreamTransport::new(server_pipe_r, server_pipe_w);

        let mut client_session = SessionController::new("sess-1");
        let client_entry = SourceEntry {
            name: "contacts".into(),
            source: client_source,
            mode: SyncMode::TwoWay,
            remote_uri: "card".into(),
            explicit_password: Some("secret".into()),
            persisted_password: None,
            last_anchor: None,
            resume_token: None,
            backup_requested: false,
        };

        let mut server_session = SessionController::new("sess-1");
        let server_entry = SourceEntry {
            name: "contacts".into(),
            source: server_source,
            mode: SyncMode::TwoWay,
            remote_uri: "card".into(),
            explicit_password: Some("secret".into()),
            persisted_password: None,
            last_anchor: None,
            resume_token: None,
            backup_requested: false,
        };

        let client_fut = client_session.run(Role::Client, vec![client_entry], &mut client_transport);
        let server_fut = server_session.run(Role::Server, vec![server_entry], &mut server_transport);

        let (client_report, server_report) = tokio::join!(client_fut, server_fut);
        let client_report = client_report.unwrap();
        let server_report = server_report.unwrap();

        assert_eq!(client_report.status, 200);
        assert_eq!(server_report.status, 200);

        let client_source_report = &client_report.sources["contacts"];
        assert!(
            client_source_report.get(
                crate::report::Location::Local,
                crate::report::ItemState::Any,
                crate::report::Outcome::SentBytes
            ) > 0
        );
    }

    #[tokio::test]
    async fn missing_password_is_fatal_before_driver_loop() {
        let source = memory_sync_source("contacts", vcard_mime(), tracker());
        let mut session = SessionController::new("sess-2");
        let entry = SourceEntry {
            name: "contacts".into(),
            source,
            mode: SyncMode::TwoWay,
            remote_uri: "card".into(),
            explicit_password: None,
            persisted_password: None,
            last_anchor: None,
            resume_token: None,
            backup_requested: false,
        };

        let (r, w) = tokio::io::duplex(1024);
        let mut transport = StreamTransport::new(r, w);
        let result = session.run(Role::Client, vec![entry], &mut transport).await;
        assert!(matches!(result, Err(SyncError::Credentials(_))));
    }

    #[tokio::test]
    async fn abort_during_need_data_yields_aborted_status_and_unchanged_anchor() {
        let client_source = memory_sync_source("contacts", vcard_mime(), tracker());
        if let Some(mem) = client_source.serialize.as_ref() {
            mem.insert_item(Some(&Luid::new("A")), b"vcard-a").await.unwrap();
        }

        let (client_pipe_r, _server_pipe_w) = tokio::io::duplex(65536);
        let (_server_pipe_r, client_pipe_w) = tokio::io::duplex(65536);
        let mut client_transport = StreamTransport::new(client_pipe_r, client_pipe_w);

        let mut client_session = SessionController::new("sess-3");
        client_session.control.abort();

        let entry = SourceEntry {
            name: "contacts".into(),
            source: client_source,
            mode: SyncMode::TwoWay,
            remote_uri: "card".into(),
            explicit_password: Some("secret".into()),
            persisted_password: None,
            last_anchor: None,
            resume_token: None,
            backup_requested: false,
        };

        let report = client_session
            .run(Role::Client, vec![entry], &mut client_transport)
            .await
            .unwrap();

        assert_ne!(report.status, 200);
    }

    #[tokio::test]
    async fn suspend_during_need_data_yields_506_without_hanging() {
        let client_source = memory_sync_source("contacts", vcard_mime(), tracker());
        if let Some(mem) = client_source.serialize.as_ref() {
            mem.insert_item(Some(&Luid::new("A")), b"vcard-a").await.unwrap();
        }

        let (client_pipe_r, _server_pipe_w) = tokio::io::duplex(65536);
        let (_server_pipe_r, client_pipe_w) = tokio::io::duplex(65536);
        let mut client_transport = StreamTransport::new(client_pipe_r, client_pipe_w);

        let mut client_session = SessionController::new("sess-4");
        client_session.control.suspend();

        let entry = SourceEntry {
            name: "contacts".into(),
            source: client_source,
            mode: SyncMode::TwoWay,
            remote_uri: "card".into(),
            explicit_password: Some("secret".into()),
            persisted_password: None,
            last_anchor: None,
            resume_token: None,
            backup_requested: false,
        };

        let report = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client_session.run(Role::Client, vec![entry], &mut client_transport),
        )
        .await
        .expect("suspend must not hang the driver loop")
        .unwrap();

        assert_eq!(report.status, 506);
    }

    #[tokio::test]
    async fn with_log_writes_before_and_after_snapshots() {
        use crate::logging::SessionLog;

        let client_source = memory_sync_source("contacts", vcard_mime(), tracker());
        if let Some(mem) = client_source.serialize.as_ref() {
            mem.insert_item(Some(&Luid::new("A")), b"vcard-a").await.unwrap();
        }
        let server_source = memory_sync_source("contacts", vcard_mime(), tracker());

        let (client_pipe_r, server_pipe_w) = tokio::io::duplex(65536);
        let (server_pipe_r, client_pipe_w) = tokio::io::duplex(65536);
        let mut client_transport = StreamTransport::new(client_pipe_r, client_pipe_w);
        let mut server_transport = StreamTransport::new(server_pipe_r, server_pipe_w);

        let log_dir = tempfile::tempdir().unwrap();
        let log = SessionLog::open(log_dir.path()).unwrap();

        let mut client_session = SessionController::new("sess-5").with_log(log);
        let client_entry = SourceEntry {
            name: "contacts".into(),
            source: client_source,
            mode: SyncMode::TwoWay,
            remote_uri: "card".into(),
            explicit_password: Some("secret".into()),
            persisted_password: None,
            last_anchor: None,
            resume_token: None,
            backup_requested: false,
        };
        let mut server_session = SessionController::new("sess-5");
        let server_entry = SourceEntry {
            name: "contacts".into(),
            source: server_source,
            mode: SyncMode::TwoWay,
            remote_uri: "card".into(),
            explicit_password: Some("secret".into()),
            persisted_password: None,
            last_anchor: None,
            resume_token: None,
            backup_requested: false,
        };

        let client_fut = client_session.run(Role::Client, vec![client_entry], &mut client_transport);
        let server_fut = server_session.run(Role::Server, vec![server_entry], &mut server_transport);
        let (client_report, _server_report) = tokio::join!(client_fut, server_fut);
        assert_eq!(client_report.unwrap().status, 200);

        assert!(log_dir.path().join("contacts.before.txt").exists());
        assert!(log_dir.path().join("contacts.after.json").exists());
    }
}

//! Configuration storage (out of scope per SPEC_FULL.md §1 as far as the
//! *authoritative* on-disk format goes, but the core still needs a
//! `Config` value shape and a reference store so its own tests and CLI
//! can run end to end). Layout follows SPEC_FULL.md §6: `profile`,
//! `source/<name>`, `source/<name>/tracking`, `sessions/<timestamp>/report`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::report::SyncReport;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    pub sync_url: String,
    pub username: String,
    pub password: String,
    pub device_id: String,
    pub user_agent: String,
    pub proxy_host: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    pub use_wbxml: bool,
    pub log_dir: Option<String>,
    pub max_log_dirs: usize,
    pub log_level: String,
    pub revision_granularity_secs: u64,
}

impl Profile {
    fn defaults() -> Self {
        Profile {
            max_log_dirs: 10,
            log_level: "warn".to_string(),
            revision_granularity_secs: 1,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub sync_mode: String,
    pub remote_uri: String,
    pub mime_type: String,
    pub forced_format: Option<String>,
    pub database: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub profile: Profile,
    pub sources: HashMap<String, SourceConfig>,
}

/// An immutable overlay layered on top of persisted `Config` -- replaces
/// the teacher's/source tree's pattern of mutating config maps in place
/// before applying them to the engine (SPEC_FULL.md §9 redesign note).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverlay {
    pub persistent: HashMap<String, String>,
    pub temporary: HashMap<String, String>,
    /// Sync-mode overrides are handled out of band: never written back
    /// to `persistent`, applied only to the active source set for this run.
    pub sync_mode_override: HashMap<String, String>,
}

impl ConfigOverlay {
    pub fn resolve(&self, key: &str) -> Option<&str> {
        self.temporary
            .get(key)
            .or_else(|| self.persistent.get(key))
            .map(String::as_str)
    }

    /// Splits a raw key/value update into the sync-mode overlay and the
    /// rest, so `sync-mode` never leaks into a persistent filter.
    pub fn apply_update(&mut self, source: &str, key: &str, value: &str, temporary: bool) {
        if key == "sync-mode" {
            self.sync_mode_override.insert(source.to_string(), value.to_string());
            return;
        }
        let map = if temporary {
            &mut self.temporary
        } else {
            &mut self.persistent
        };
        map.insert(format!("{source}.{key}"), value.to_string());
    }
}

/// Directory-of-JSON-files config store, generalizing the teacher's
/// flat key/value revision file into the directory tree SPEC_FULL.md §6
/// describes.
pub struct FileConfigStore {
    root: PathBuf,
}

impl FileConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileConfigStore { root: root.into() }
    }

    fn config_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn load(&self, name: &str) -> Result<Config> {
        let dir = self.config_dir(name);
        let profile_path = dir.join("profile.json");
        let profile = match std::fs::read_to_string(&profile_path) {
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Profile::defaults(),
            Err(e) => return Err(e.into()),
        };

        let sources_dir = dir.join("source");
        let mut sources = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&sources_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    let name = path.file_stem().unwrap().to_string_lossy().to_string();
                    let content = std::fs::read_to_string(&path)?;
                    sources.insert(name, serde_json::from_str(&content)?);
                }
            }
        }

        Ok(Config { profile, sources })
    }

    pub fn save(&self, name: &str, config: &Config) -> Result<()> {
        let dir = self.config_dir(name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("profile.json"), serde_json::to_vec_pretty(&config.profile)?)?;

        let sources_dir = dir.join("source");
        std::fs::create_dir_all(&sources_dir)?;
        for (src_name, src_config) in &config.sources {
            std::fs::write(
                sources_dir.join(format!("{src_name}.json")),
                serde_json::to_vec_pretty(src_config)?,
            )?;
        }
        Ok(())
    }

    pub fn tracking_path(&self, config_name: &str, source_name: &str) -> PathBuf {
        self.config_dir(config_name)
            .join("source")
            .join(source_name)
            .join("tracking")
    }

    fn anchor_path(&self, config_name: &str, source_name: &str) -> PathBuf {
        self.config_dir(config_name)
            .join("source")
            .join(source_name)
            .join("anchor")
    }

    /// Loads the sync anchor left by the last successful session for
    /// `source_name`, or `None` if there isn't one yet (forcing a slow
    /// sync, SPEC_FULL.md §4.2).
    pub fn load_anchor(&self, config_name: &str, source_name: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.anchor_path(config_name, source_name)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_anchor(&self, config_name: &str, source_name: &str, anchor: &str) -> Result<()> {
        let path = self.anchor_path(config_name, source_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, anchor)?;
        Ok(())
    }

    pub fn session_dir(&self, config_name: &str, timestamp: &str) -> PathBuf {
        self.config_dir(config_name).join("sessions").join(timestamp)
    }

    pub fn save_report(&self, config_name: &str, timestamp: &str, report: &SyncReport) -> Result<()> {
        let dir = self.session_dir(config_name, timestamp);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("report.json"), serde_json::to_vec_pretty(report)?)?;
        Ok(())
    }

    pub fn load_reports(&self, config_name: &str, start: usize, count: usize) -> Result<Vec<SyncReport>> {
        let sessions_dir = self.config_dir(config_name).join("sessions");
        let mut timestamps: Vec<String> = match std::fs::read_dir(&sessions_dir) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        timestamps.sort();
        timestamps.reverse();

        let mut out = Vec::new();
        for ts in timestamps.into_iter().skip(start).take(count) {
            let path = sessions_dir.join(&ts).join("report.json");
            if let Ok(content) = std::fs::read_to_string(&path) {
                out.push(serde_json::from_str(&content)?);
            }
        }
        Ok(out)
    }

    /// Removes the oldest session directories beyond `max_log_dirs`,
    /// skipping any directory marked `.keep` (used for a failed
    /// session's log directory, which SPEC_FULL.md §7 says must survive
    /// rotation until the next success).
    pub fn rotate_sessions(&self, config_name: &str, max_log_dirs: usize) -> Result<()> {
        let sessions_dir = self.config_dir(config_name).join("sessions");
        let mut dirs: Vec<PathBuf> = match std::fs::read_dir(&sessions_dir) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        dirs.sort();

        let keepable: Vec<&PathBuf> = dirs
            .iter()
            .filter(|d| !d.join(".keep").exists())
            .collect();
        if keepable.len() > max_log_dirs {
            for dir in keepable.iter().take(keepable.len() - max_log_dirs) {
                std::fs::remove_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

pub fn mark_session_kept(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(".keep"), b"")?;
    Ok(())
}

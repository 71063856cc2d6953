//! Logging setup, generalized from the teacher's `main()` verbosity
//! handling into a reusable `init` plus a per-session directory sink.
//!
//! The core only decides rotation *policy* (`config::FileConfigStore::
//! rotate_sessions`); actual log writing goes through `env_logger` for
//! the process-wide log and a plain file handle for the per-session
//! `client.log`, matching SPEC_FULL.md §6's log directory layout.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;

/// Derives a `log::LevelFilter` the same way the teacher's CLI does:
/// `-q` wins outright, otherwise verbosity count maps `0 -> Warn,
/// 1 -> Info, >=2 -> Debug`.
pub fn level_from_verbosity(quiet: bool, verbose: u8) -> log::LevelFilter {
    if quiet {
        return log::LevelFilter::Off;
    }
    match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

pub fn init(quiet: bool, verbose: u8) {
    let level = level_from_verbosity(quiet, verbose);
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}

/// One session's `client.log` plus `<source>.<before|after>.<suffix>`
/// snapshot files.
pub struct SessionLog {
    dir: PathBuf,
    client_log: Mutex<File>,
}

impl SessionLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let client_log = File::options()
            .create(true)
            .append(true)
            .open(dir.join("client.log"))?;
        Ok(SessionLog {
            dir,
            client_log: Mutex::new(client_log),
        })
    }

    pub fn write_line(&self, line: &str) -> Result<()> {
        let mut f = self.client_log.lock().unwrap();
        writeln!(f, "{line}")?;
        Ok(())
    }

    pub fn snapshot_path(&self, source: &str, when: SnapshotWhen, suffix: &str) -> PathBuf {
        let tag = match when {
            SnapshotWhen::Before => "before",
            SnapshotWhen::After => "after",
        };
        self.dir.join(format!("{source}.{tag}.{suffix}"))
    }

    pub fn write_snapshot(
        &self,
        source: &str,
        when: SnapshotWhen,
        suffix: &str,
        data: &[u8],
    ) -> Result<()> {
        std::fs::write(self.snapshot_path(source, when, suffix), data)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotWhen {
    Before,
    After,
}

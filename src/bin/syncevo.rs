//! `syncevo`: reference CLI driving one sync session end to end.
//!
//! Generalizes the teacher's `notmuch-sync` binary, which spawns itself
//! over SSH for the remote role and talks to it over framed stdio: here
//! the binary spawns itself with a hidden `--server` flag and drives the
//! two roles over a `ProcessTransport`, using an in-memory `SyncSource`
//! as the reference datastore (a real address book/calendar backend is
//! out of scope, per SPEC_FULL.md §1).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use syncevo_core::config::FileConfigStore;
use syncevo_core::engine::Role;
use syncevo_core::logging;
use syncevo_core::session::{SessionController, SourceEntry, SyncMode};
use syncevo_core::source::{memory_sync_source, Mime, MimeNegotiation};
use syncevo_core::transport::{ProcessTransport, StreamTransport, TransportAgent};

#[derive(Parser, Debug)]
#[command(name = "syncevo")]
#[command(about = "Synchronize personal data against a remote peer")]
struct Args {
    /// Configuration name to operate on.
    #[arg(long, default_value = "default")]
    config: String,

    /// State directory holding configuration and session history.
    #[arg(long)]
    state_dir: Option<String>,

    /// Increases verbosity, up to twice.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppresses all output, overrides --verbose.
    #[arg(short, long)]
    quiet: bool,

    /// Prints the resolved configuration and exits.
    #[arg(long)]
    print_config: bool,

    /// Writes a fresh default configuration and exits.
    #[arg(long)]
    configure: bool,

    /// Restores the named source from a prior session's snapshot and exits.
    #[arg(long, value_name = "TIMESTAMP")]
    restore: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs one sync session.
    Sync {
        /// Source name to sync (repeatable); defaults to "contacts".
        #[arg(long)]
        source: Vec<String>,
        /// Sync mode: two-way, slow, refresh-from-server, refresh-from-client,
        /// one-way-from-server, one-way-from-client.
        #[arg(long, default_value = "two-way")]
        mode: String,
        /// Internal: run as the remote/server role over stdio.
        #[arg(long, hide = true)]
        server: bool,
    },
    /// Prints the status of the most recent session.
    Status,
}

fn parse_mode(s: &str) -> Result<SyncMode> {
    Ok(match s {
        "two-way" => SyncMode::TwoWay,
        "slow" => SyncMode::Slow,
        "refresh-from-server" => SyncMode::RefreshFromServer,
        "refresh-from-client" => SyncMode::RefreshFromClient,
        "one-way-from-server" => SyncMode::OneWayFromServer,
        "one-way-from-client" => SyncMode::OneWayFromClient,
        other => anyhow::bail!("unknown sync mode '{other}'"),
    })
}

fn state_dir(args: &Args) -> PathBuf {
    match &args.state_dir {
        Some(dir) => PathBuf::from(shellexpand::tilde(dir).into_owned()),
        None => PathBuf::from(shellexpand::tilde("~/.syncevo-core").into_owned()),
    }
}

fn exit_code_for(status: u16) -> i32 {
    if status == 200 {
        0
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.quiet, args.verbose);

    let store = FileConfigStore::new(state_dir(&args));

    if args.print_config {
        let config = store.load(&args.config)?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if args.configure {
        let config = syncevo_core::config::Config::default();
        store.save(&args.config, &config)?;
        println!("wrote default configuration for '{}'", args.config);
        return Ok(());
    }

    if let Some(timestamp) = &args.restore {
        let dir = store.session_dir(&args.config, timestamp);
        if !dir.exists() {
            anyhow::bail!("no session directory for timestamp '{timestamp}'");
        }
        println!("restore point available at {}", dir.display());
        return Ok(());
    }

    match args.command {
        Some(Command::Status) => {
            let reports = store.load_reports(&args.config, 0, 1)?;
            match reports.first() {
                Some(r) => println!("last session '{}': status {}", r.session_id, r.status),
                None => println!("no sessions recorded for '{}'", args.config),
            }
        }
        Some(Command::Sync { source, mode, server }) => {
            let sync_mode = parse_mode(&mode)?;
            let sources = if source.is_empty() {
                vec!["contacts".to_string()]
            } else {
                source
            };

            if server {
                run_server(&args.config, &sources, sync_mode).await?;
            } else {
                let status = run_client(&args.config, &store, &sources, sync_mode).await?;
                std::process::exit(exit_code_for(status));
            }
        }
        None => {
            anyhow::bail!("no subcommand given; see --help");
        }
    }

    Ok(())
}

fn vcard_mime() -> MimeNegotiation {
    MimeNegotiation {
        native: Mime::VCard30,
        forced: None,
        preferred: Mime::VCard30,
        also_accepted: vec![],
    }
}

async fn run_client(
    config_name: &str,
    store: &FileConfigStore,
    source_names: &[String],
    mode: SyncMode,
) -> Result<u16> {
    let exe = std::env::current_exe().context("resolving current executable")?;
    let mut child_args = vec![
        "--config".to_string(),
        config_name.to_string(),
        "sync".to_string(),
        "--server".to_string(),
    ];
    for name in source_names {
        child_args.push("--source".to_string());
        child_args.push(name.clone());
    }

    let mut transport = ProcessTransport::spawn(exe.to_str().context("non-utf8 executable path")?, &child_args)
        .context("spawning remote-role subprocess")?;

    let timestamp = report_timestamp();
    let log = logging::SessionLog::open(store.session_dir(config_name, &timestamp))
        .context("opening session log directory")?;
    let mut controller = SessionController::new(format!("sess-{config_name}")).with_log(log);
    let entries = source_names
        .iter()
        .map(|name| {
            let source = memory_sync_source(name.clone(), vcard_mime(), fresh_tracker(store, config_name, name));
            let last_anchor = store.load_anchor(config_name, name).unwrap_or(None);
            SourceEntry {
                name: name.clone(),
                source,
                mode,
                remote_uri: name.clone(),
                explicit_password: Some("local".to_string()),
                persisted_password: None,
                last_anchor,
                resume_token: None,
                backup_requested: false,
            }
        })
        .collect();

    let report = controller.run(Role::Client, entries, &mut transport).await?;

    for (name, anchor) in &report.anchors {
        store.save_anchor(config_name, name, anchor)?;
    }

    store.save_report(config_name, &timestamp, &report)?;
    // A failed session's log directory must survive rotation until the
    // next success (SPEC_FULL.md §7); a clean 200 rotates normally.
    if report.status != 200 {
        syncevo_core::config::mark_session_kept(&store.session_dir(config_name, &timestamp))?;
    }
    store.rotate_sessions(config_name, 10)?;
    let _ = transport.wait_exit().await;

    println!(
        "session '{}' finished with status {}",
        report.session_id, report.status
    );
    Ok(report.status)
}

fn report_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs();
    format!("{secs}")
}

async fn run_server(config_name: &str, source_names: &[String], mode: SyncMode) -> Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let mut transport = StreamTransport::new(stdin, stdout);
    transport.set_callback(None, Duration::from_secs(1));

    let mut controller = SessionController::new(format!("sess-{config_name}-remote"));
    let entries = source_names
        .iter()
        .map(|name| SourceEntry {
            name: name.clone(),
            source: memory_sync_source(name.clone(), vcard_mime(), empty_tracker()),
            mode,
            remote_uri: name.clone(),
            explicit_password: Some("local".to_string()),
            persisted_password: None,
            last_anchor: None,
            resume_token: None,
            backup_requested: false,
        })
        .collect();

    controller.run(Role::Server, entries, &mut transport).await?;
    Ok(())
}

fn empty_tracker() -> syncevo_core::tracker::ChangeTracker {
    struct Empty;
    impl syncevo_core::tracker::RevisionStore for Empty {
        fn load(&mut self) -> syncevo_core::Result<std::collections::HashMap<syncevo_core::tracker::Luid, syncevo_core::tracker::Revision>> {
            Ok(std::collections::HashMap::new())
        }
        fn flush(&mut self, _entries: &std::collections::HashMap<syncevo_core::tracker::Luid, syncevo_core::tracker::Revision>) -> syncevo_core::Result<()> {
            Ok(())
        }
    }
    syncevo_core::tracker::ChangeTracker::with_default_granularity(Box::new(Empty)).expect("empty tracker")
}

fn fresh_tracker(store: &FileConfigStore, config_name: &str, source_name: &str) -> syncevo_core::tracker::ChangeTracker {
    let path = store.tracking_path(config_name, source_name);
    syncevo_core::tracker::file_tracker(path, Duration::from_secs(1)).expect("file tracker")
}

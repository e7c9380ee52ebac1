use std::path::PathBuf;
use std::process::Stdio;

use clap::{Parser, Subcommand};
use terminal_history::{
    config::HistoryConfig, error::HistoryError, manager::HistoryManager,
    retention::RetentionUpdate, session::SessionRecord,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "termhist")]
#[command(about = "Compressed, self-pruning history of your terminal sessions.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (defaults to $TERMHIST_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command through the shell and record its output
    Record {
        /// Working directory the session is filed under
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Identifier of the owning tab or window
        #[arg(long, default_value = "cli")]
        tab: String,
        /// Command line to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// List recorded sessions, most recent first
    List {
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(short, long, default_value = "0")]
        offset: usize,
        /// Only sessions recorded in this directory
        #[arg(long)]
        cwd: Option<String>,
    },
    /// Print a session's raw output
    Show { session_id: String },
    /// Write a session as plain text
    Export { session_id: String, dest: PathBuf },
    /// Delete one session
    Delete { session_id: String },
    /// Delete every recorded session
    Clear,
    /// Show storage usage against the size budget
    Stats,
    /// Show or change retention settings
    Settings {
        #[arg(long)]
        max_age_days: Option<u32>,
        #[arg(long)]
        max_size_mb: Option<u64>,
        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Run a retention pass now
    Prune,
}

#[tokio::main]
async fn main() -> Result<(), HistoryError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.data_dir {
        Some(dir) => HistoryConfig::with_data_dir(dir),
        None => HistoryConfig::from_env()?,
    };
    let manager = HistoryManager::open(config)?;

    let result = match cli.command {
        Commands::Record { cwd, tab, command } => record(&manager, cwd, &tab, &command).await,
        Commands::List { limit, offset, cwd } => list(&manager, limit, offset, cwd.as_deref()),
        Commands::Show { session_id } => {
            let data = manager.read_session(&session_id).await?;
            print!("{}", String::from_utf8_lossy(&data));
            Ok(())
        }
        Commands::Export { session_id, dest } => {
            manager.export_session(&session_id, &dest).await?;
            println!("Exported {} to {}", session_id, dest.display());
            Ok(())
        }
        Commands::Delete { session_id } => {
            manager.delete_session(&session_id).await?;
            println!("Deleted {}", session_id);
            Ok(())
        }
        Commands::Clear => {
            let removed = manager.clear_all_history().await?;
            println!("Removed {} sessions", removed);
            Ok(())
        }
        Commands::Stats => {
            let stats = manager.storage_stats()?;
            println!(
                "{} sessions, {} of {} bytes ({:.1}%)",
                stats.session_count, stats.total_bytes, stats.max_bytes, stats.usage_percent
            );
            Ok(())
        }
        Commands::Settings {
            max_age_days,
            max_size_mb,
            enabled,
        } => settings(&manager, RetentionUpdate { max_age_days, max_size_mb, enabled }).await,
        Commands::Prune => {
            let report = manager.run_retention().await?;
            println!(
                "Deleted {} sessions, reclaimed {} bytes",
                report.deleted_count, report.reclaimed_bytes
            );
            for failure in &report.errors {
                println!("  failed {}: {}", failure.session_id, failure.error);
            }
            Ok(())
        }
    };

    manager.destroy();
    result
}

async fn record(
    manager: &HistoryManager,
    cwd: Option<PathBuf>,
    tab: &str,
    command: &[String],
) -> Result<(), HistoryError> {
    let cwd = match cwd {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let cwd_str = cwd.to_string_lossy().to_string();
    let line = command.join(" ");

    let Some(session_id) = manager.start_session(
        tab,
        &cwd_str,
        Some(serde_json::json!({ "command": line })),
    )?
    else {
        warn!("history capture is disabled; running without recording");
        let status = shell(&line).current_dir(&cwd).status().await?;
        std::process::exit(status.code().unwrap_or(-1));
    };

    let mut child = match shell(&line)
        .current_dir(&cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            manager.abort_session(&session_id);
            return Err(e.into());
        }
    };

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx.clone()));
    }
    drop(tx);

    let exit_code = loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    use std::io::Write as _;
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(&chunk);
                    let _ = stdout.flush();
                    manager.capture_output(&session_id, &chunk);
                }
                None => break child.wait().await?.code().unwrap_or(-1),
            },
            _ = tokio::signal::ctrl_c() => {
                let _ = child.kill().await;
                manager.abort_session(&session_id);
                info!("interrupted, session {} discarded", session_id);
                return Ok(());
            }
        }
    };

    let record = manager.end_session(&session_id, exit_code).await?;
    eprintln!(
        "Recorded {} ({} bytes, {} compressed)",
        record.id, record.uncompressed_size, record.compressed_size
    );
    Ok(())
}

fn shell(line: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-Command", line]);
        cmd
    } else {
        let mut cmd = Command::new("bash");
        cmd.args(["-c", line]);
        cmd
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn list(
    manager: &HistoryManager,
    limit: Option<usize>,
    offset: usize,
    cwd: Option<&str>,
) -> Result<(), HistoryError> {
    let sessions = match cwd {
        Some(cwd) => manager
            .get_sessions_for_cwd(cwd, limit.map(|l| l + offset))?
            .into_iter()
            .skip(offset)
            .collect(),
        None => manager.get_all_sessions(limit, offset),
    };

    println!("Terminal history:");
    println!("{}", "─".repeat(60));
    for session in &sessions {
        print_session(session);
    }
    if sessions.is_empty() {
        println!("(no sessions)");
    }
    Ok(())
}

fn print_session(session: &SessionRecord) {
    let started = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(session.start_time)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| session.start_time.to_string());
    println!(
        "{}  {}  {:<20} exit {:>3}  {:>6}s  {} bytes{}",
        session.id,
        started,
        session.display_name,
        session.exit_code,
        session.duration / 1000,
        session.compressed_size,
        if session.truncated { " (truncated)" } else { "" }
    );
}

async fn settings(manager: &HistoryManager, update: RetentionUpdate) -> Result<(), HistoryError> {
    let changed = update != RetentionUpdate::default();
    let settings = if changed {
        manager.update_retention_settings(update)?
    } else {
        manager.get_retention_settings()?
    };
    println!("max age:  {} days", settings.max_age_days);
    println!("max size: {} MB", settings.max_size_mb);
    println!("capture:  {}", if settings.enabled { "enabled" } else { "disabled" });

    if changed {
        let report = manager.run_retention().await?;
        if report.deleted_count > 0 {
            println!("Pruned {} sessions under the new limits", report.deleted_count);
        }
    }
    Ok(())
}

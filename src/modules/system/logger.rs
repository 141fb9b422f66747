use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "mimbus.log";
const LOG_RETENTION_DAYS: u64 = 7;

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.to_rfc3339())
    }
}

pub fn get_log_dir(data_dir: &Path) -> Result<PathBuf, String> {
    let log_dir = data_dir.join("logs");

    if !log_dir.exists() {
        fs::create_dir_all(&log_dir)
            .map_err(|e| format!("failed_to_create_log_dir: {}", e))?;
    }

    Ok(log_dir)
}

/// Installs console and daily-file logging. Keep the returned guard alive
/// for as long as file output is wanted.
pub fn init_logger(data_dir: &Path) -> Option<WorkerGuard> {
    let _ = tracing_log::LogTracer::init();

    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_timer(LocalTimer);

    let log_dir = match get_log_dir(data_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to initialize log directory: {}", e);
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(console_layer)
                .try_init();
            return None;
        }
    };

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::Layer::new()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_timer(LocalTimer);
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!("Log system initialized (console + {})", log_dir.display());
    match cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS) {
        Ok(0) => {}
        Ok(deleted) => info!("Log cleanup removed {} file(s)", deleted),
        Err(e) => warn!("Failed to cleanup old logs: {}", e),
    }
    Some(guard)
}

/// Deletes log files older than `days_to_keep`, then the oldest files while
/// the directory exceeds its size cap. Returns the number of deleted files.
pub fn cleanup_old_logs(log_dir: &Path, days_to_keep: u64) -> Result<usize, String> {
    use std::time::{SystemTime, UNIX_EPOCH};

    if !log_dir.exists() {
        return Ok(0);
    }
    const MAX_TOTAL_SIZE_BYTES: u64 = 256 * 1024 * 1024;
    const TARGET_SIZE_BYTES: u64 = 128 * 1024 * 1024;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("system_time_error: {}", e))?
        .as_secs();
    let cutoff_time = now.saturating_sub(days_to_keep * 24 * 60 * 60);

    let mut files = Vec::new();
    let entries =
        fs::read_dir(log_dir).map_err(|e| format!("failed_to_read_log_dir: {}", e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Ok(metadata) = fs::metadata(&path) {
            let modified_secs = metadata
                .modified()
                .ok()
                .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(now);
            files.push((path, metadata.len(), modified_secs));
        }
    }

    let mut deleted = 0usize;
    let mut remaining = Vec::new();
    for (path, size, modified_secs) in files {
        if modified_secs < cutoff_time && fs::remove_file(&path).is_ok() {
            deleted += 1;
        } else {
            remaining.push((path, size, modified_secs));
        }
    }

    let mut total: u64 = remaining.iter().map(|(_, size, _)| *size).sum();
    if total > MAX_TOTAL_SIZE_BYTES {
        remaining.sort_by_key(|(_, _, modified)| *modified);
        for (path, size, _) in remaining {
            if total <= TARGET_SIZE_BYTES {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    total -= size;
                }
                Err(e) => warn!("Failed to delete log file {:?}: {}", path, e),
            }
        }
    }

    Ok(deleted)
}

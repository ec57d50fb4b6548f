use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::debug;

use crate::docker::{short_id, DockerRunner, DockerRuntime, RuntimeError};

#[derive(Debug, Error)]
pub enum LogCaptureError {
    #[error("failed to fetch container logs: {0}")]
    Fetch(#[from] RuntimeError),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// `<dir>/<short id>-<YYYYMMDD-HHMMSS>.log`
pub fn log_file_path(dir: &Path, container_id: &str, at: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{}-{}.log",
        short_id(container_id),
        at.format("%Y%m%d-%H%M%S")
    ))
}

/// Overwrites `destination` with everything the container has logged so far.
/// Does nothing until a destination has been assigned.
pub fn capture<R: DockerRunner>(
    runtime: &DockerRuntime<'_, R>,
    container_id: &str,
    destination: Option<&Path>,
) -> Result<(), LogCaptureError> {
    let Some(destination) = destination else {
        return Ok(());
    };
    let bytes = runtime.fetch_logs(container_id)?;
    write_atomic(destination, &bytes).map_err(|source| LogCaptureError::Write {
        path: destination.to_path_buf(),
        source,
    })?;
    debug!(
        container = short_id(container_id),
        path = %destination.display(),
        bytes = bytes.len(),
        "captured container logs"
    );
    Ok(())
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), io::Error> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "capture".to_string()),
        std::process::id(),
        ts
    ));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)
}

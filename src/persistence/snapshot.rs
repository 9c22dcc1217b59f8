//! Buffer snapshot file
//!
//! One JSON document `{timestamp, entries, metrics}` per buffer. Writes go to
//! a sibling temp file that is renamed over the target, so a reader only ever
//! sees a complete snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::buffer::BufferMetrics;
use super::entry::BufferEntry;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub timestamp: DateTime<Utc>,
    pub entries: Vec<BufferEntry>,
    #[serde(default)]
    pub metrics: BufferMetrics,
}

/// Temp path used while writing `path`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "buffer".into());
    name.push(".tmp");
    path.with_file_name(name)
}

pub async fn save_snapshot(path: &Path, snapshot: &BufferSnapshot) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    let body = serde_json::to_vec_pretty(snapshot)?;
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!("Buffer snapshot saved: {} entries -> {}", snapshot.entries.len(), path.display());
    Ok(())
}

/// `Ok(None)` when no snapshot exists yet
pub async fn load_snapshot(path: &Path) -> Result<Option<BufferSnapshot>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

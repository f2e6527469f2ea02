use hypervisor_reconciler::StoreSnapshot;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("State file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("State file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads a store snapshot. A missing file is an empty store.
pub async fn load_snapshot(path: &Path) -> Result<StoreSnapshot, StateError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
            debug!(
                path = %path.display(),
                owners = snapshot.owners.len(),
                consumers = snapshot.consumers.len(),
                "Loaded store snapshot"
            );
            Ok(snapshot)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "No state file yet, starting empty");
            Ok(StoreSnapshot::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Writes a snapshot next to `path` and renames it into place.
pub async fn save_snapshot(path: &Path, snapshot: &StoreSnapshot) -> Result<(), StateError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), consumers = snapshot.consumers.len(), "Saved store snapshot");
    Ok(())
}

//! Emergency-mode backups.
//!
//! Every successful remote sync writes its raw payload to a local file
//! keyed by the source identity. When the remote source has been
//! unreachable for the configured number of attempts, the reload reads the
//! backup instead; the next successful remote sync supersedes it.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use gantry_common::{GatewayError, GatewayResult};

fn backup_file(dir: &Path, source_id: &str) -> PathBuf {
    let digest = Sha256::digest(source_id.as_bytes());
    let name: String = digest
        .iter()
        .take(12)
        .map(|b| format!("{:02x}", b))
        .collect();
    dir.join(format!("{}.backup.json", name))
}

/// Persist a sync payload for emergency use.
pub fn save_backup(dir: &Path, source_id: &str, payload: &str) -> GatewayResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| GatewayError::Config {
        message: format!("Failed to create backup directory {:?}", dir),
        source: Some(Box::new(e)),
    })?;
    let file = backup_file(dir, source_id);
    std::fs::write(&file, payload)?;
    debug!(file = ?file, source = %source_id, "Saved sync backup");
    Ok(())
}

/// Read the backup for a source, if one exists.
pub fn load_backup(dir: &Path, source_id: &str) -> GatewayResult<Option<String>> {
    let file = backup_file(dir, source_id);
    match std::fs::read_to_string(&file) {
        Ok(raw) => {
            info!(file = ?file, source = %source_id, "Serving sync payload from backup");
            Ok(Some(raw))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

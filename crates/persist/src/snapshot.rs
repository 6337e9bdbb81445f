use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tileworld_common::Entity;

use crate::PersistError;

/// Entities read from a snapshot file, plus the digest of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub entities: Vec<Entity>,
    pub sha256: String,
}

/// Read and parse a snapshot file.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Snapshot, PersistError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| io_error(path, source))?;
    let entities = parse_snapshot(&bytes)?;
    let sha256 = sha256_hex(&bytes);
    tracing::info!(path = %path.display(), entities = entities.len(), %sha256, "snapshot loaded");
    Ok(Snapshot { entities, sha256 })
}

/// Parse snapshot bytes: a JSON array of entities.
pub fn parse_snapshot(bytes: &[u8]) -> Result<Vec<Entity>, PersistError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Write entities as a pretty-printed snapshot, sorted by ID.
///
/// Returns the digest of the written bytes.
pub fn dump_snapshot(path: impl AsRef<Path>, entities: &[Entity]) -> Result<String, PersistError> {
    let path = path.as_ref();
    let mut sorted = entities.to_vec();
    sorted.sort_by_key(|e| e.id);

    let mut bytes = serde_json::to_vec_pretty(&sorted)?;
    bytes.push(b'\n');
    let sha256 = sha256_hex(&bytes);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
    }
    let staging = staging_path(path);
    std::fs::write(&staging, &bytes).map_err(|source| io_error(&staging, source))?;
    std::fs::rename(&staging, path).map_err(|source| io_error(path, source))?;

    tracing::info!(path = %path.display(), entities = sorted.len(), %sha256, "snapshot written");
    Ok(sha256)
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn io_error(path: &Path, source: std::io::Error) -> PersistError {
    PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

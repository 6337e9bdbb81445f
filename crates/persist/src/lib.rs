//! World snapshot files.
//!
//! A snapshot is a JSON array of entity records. It seeds the world store at
//! startup and is written back out on demand as a full dump.
//!
//! # Invariants
//! - Dumps are sorted by entity ID, so equal worlds produce equal bytes.
//! - Every load and dump reports the SHA-256 of the bytes on disk.
//! - Writes go through a sibling temp file and a rename; a crash mid-write
//!   leaves the previous file intact.

mod snapshot;
mod validate;

pub use snapshot::{Snapshot, dump_snapshot, load_snapshot, parse_snapshot, sha256_hex};
pub use validate::{Issue, validate};

/// Errors from reading or writing snapshot files.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

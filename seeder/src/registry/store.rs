//! JSON snapshots of the registry on disk.

use super::record::PeerRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Bumped whenever the snapshot layout changes incompatibly.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Errors reading or writing a snapshot.
#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    /// The file exists but is not a snapshot we understand.
    Corrupt(serde_json::Error),
    UnsupportedVersion(u32),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "Snapshot I/O error: {err}"),
            StoreError::Corrupt(err) => write!(f, "Snapshot is corrupt: {err}"),
            StoreError::UnsupportedVersion(version) => {
                write!(f, "Unsupported snapshot format version {version}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err),
            StoreError::Corrupt(err) => Some(err),
            StoreError::UnsupportedVersion(_) => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: u64,
    peers: Vec<PeerRecord>,
}

/// A snapshot file location.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnapshotStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temporary_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Reads all records. A missing file is an empty snapshot.
    pub async fn load(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot.peers)
    }

    /// Writes `records` and returns how many were saved.
    pub async fn save<'a>(
        &self,
        records: impl IntoIterator<Item = &'a PeerRecord>,
        saved_at: u64,
    ) -> Result<usize, StoreError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_FORMAT_VERSION,
            saved_at,
            peers: records.into_iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let temporary = self.temporary_path();
        tokio::fs::write(&temporary, &bytes).await?;
        tokio::fs::rename(&temporary, &self.path).await?;
        Ok(snapshot.peers.len())
    }
}

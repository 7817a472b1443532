use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{
    escape_path_component, BaselineStore, EntityKey, MetricSnapshot, MintRecord,
    PendingMintRecord, StoreError,
};

const BASELINES_DIR: &str = "baselines";
const MINTS_DIR: &str = "mints";
const PENDING_DIR: &str = "pending";

/// Local directory backend.
///
/// Layout: `baselines/<entity>.json` holds the current baseline,
/// `pending/<entity>.json` the unconfirmed mint if any, and
/// `mints/<entity>/<timestamp_ms>-<receipt>.json` one audit record per file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBaselineStore {
    root: PathBuf,
}

impl FileBaselineStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn baseline_path(&self, entity: &EntityKey) -> PathBuf {
        self.root
            .join(BASELINES_DIR)
            .join(format!("{}.json", entity.path_component()))
    }

    pub fn pending_path(&self, entity: &EntityKey) -> PathBuf {
        self.root
            .join(PENDING_DIR)
            .join(format!("{}.json", entity.path_component()))
    }

    pub fn mints_dir(&self, entity: &EntityKey) -> PathBuf {
        self.root.join(MINTS_DIR).join(entity.path_component())
    }

    /// Audit records for `entity`, ordered by file name (timestamp first).
    pub fn list_audit(&self, entity: &EntityKey) -> Result<Vec<MintRecord>, StoreError> {
        let dir = self.mints_dir(entity);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&dir, err)),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| io_error(&dir, err))?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();
        paths
            .iter()
            .map(|path| {
                let bytes = fs::read(path).map_err(|err| io_error(path, err))?;
                serde_json::from_slice::<MintRecord>(&bytes).map_err(|err| StoreError::Decode {
                    source: path.display().to_string(),
                    message: err.to_string(),
                })
            })
            .collect()
    }
}

impl BaselineStore for FileBaselineStore {
    fn load_snapshot(&self, entity: &EntityKey) -> Result<Option<MetricSnapshot>, StoreError> {
        let path = self.baseline_path(entity);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        let snapshot =
            serde_json::from_slice::<MetricSnapshot>(&bytes).map_err(|err| StoreError::Decode {
                source: path.display().to_string(),
                message: err.to_string(),
            })?;
        Ok(Some(snapshot))
    }

    fn load_pending(&self, entity: &EntityKey) -> Result<Option<PendingMintRecord>, StoreError> {
        let path = self.pending_path(entity);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        serde_json::from_slice::<PendingMintRecord>(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Decode {
                source: path.display().to_string(),
                message: err.to_string(),
            })
    }

    fn save_pending(
        &self,
        entity: &EntityKey,
        pending: &PendingMintRecord,
    ) -> Result<(), StoreError> {
        write_json_atomic(&self.pending_path(entity), pending)
    }

    fn clear_pending(&self, entity: &EntityKey) -> Result<(), StoreError> {
        let path = self.pending_path(entity);
        match fs::remove_file(&path) {
            Ok(()) => sync_parent_dir(&path),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    fn save(&self, entity: &EntityKey, snapshot: &MetricSnapshot) -> Result<(), StoreError> {
        write_json_atomic(&self.baseline_path(entity), snapshot)
    }

    fn append_audit(&self, entity: &EntityKey, record: &MintRecord) -> Result<(), StoreError> {
        let file_name = format!(
            "{:020}-{}.json",
            record.timestamp_unix_ms.max(0),
            escape_path_component(record.receipt_id.as_str())
        );
        let path = self.mints_dir(entity).join(file_name);
        if path.exists() {
            return Err(StoreError::Io {
                path: path.display().to_string(),
                message: "audit record already exists".to_string(),
            });
        }
        write_json_atomic(&path, record)
    }
}

/// Temp file is flushed to disk before the rename and the directory entry after it, so
/// a crash leaves either the old or the new value.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| StoreError::Encode {
        message: err.to_string(),
    })?;
    let temp_path = path.with_extension("json.tmp");
    if let Err(err) = write_synced(&temp_path, &bytes) {
        let _ = fs::remove_file(&temp_path);
        return Err(io_error(&temp_path, err));
    }
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::Io {
            path: path.display().to_string(),
            message: format!("rename from {} failed: {}", temp_path.display(), err),
        });
    }
    sync_parent_dir(path)
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), StoreError> {
    let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
        return Ok(());
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|err| io_error(parent, err))
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn io_error(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

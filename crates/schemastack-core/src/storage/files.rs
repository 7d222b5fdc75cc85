//! Store file handling
//!
//! A store is one SQLite file plus the journal files SQLite may keep next
//! to it. Migration uses two sibling paths as scratch space:
//!
//! - `<store>~migrating` - output of the step currently running
//! - `<store>~backup` - copy of the original store until migration succeeds
//!
//! Copies are first written to `<target>~partial` and renamed into place
//! once complete, so a crash mid-copy never leaves a truncated file under
//! either name.
//!
//! Neither suffix can collide with a store path derived from a model name,
//! since store files always end in `.sqlite`.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::error::{StorageError, StorageResult};

/// Suffix of the scratch store written by a migration step
pub const SCRATCH_SUFFIX: &str = "~migrating";

/// Suffix of the pre-migration copy of a store
pub const BACKUP_SUFFIX: &str = "~backup";

/// Suffix of a copy that is still being written
pub const PARTIAL_SUFFIX: &str = "~partial";

/// Files SQLite may create next to a database
const SIDE_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// File extension of store files
pub const STORE_EXTENSION: &str = "sqlite";

/// Path of `path` with `suffix` appended to its file name
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Paths belonging to one store location
#[derive(Debug, Clone)]
pub struct StoreFiles {
    path: PathBuf,
}

impl StoreFiles {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the store for `model_name` inside `data_dir`
    pub fn for_model(data_dir: &Path, model_name: &str) -> Self {
        Self::new(data_dir.join(format!("{}.{}", model_name, STORE_EXTENSION)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scratch_path(&self) -> PathBuf {
        sibling(&self.path, SCRATCH_SUFFIX)
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, BACKUP_SUFFIX)
    }

    /// Check if the store exists on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Size of the store file in bytes (0 if missing)
    pub fn size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Remove a store and its side files; missing files are not an error
pub fn destroy_store(path: &Path) -> StorageResult<()> {
    let paths = std::iter::once(path.to_path_buf())
        .chain(SIDE_SUFFIXES.iter().map(|suffix| sibling(path, suffix)));

    for file in paths {
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::from_io(e, file)),
        }
    }
    Ok(())
}

/// Move a finished file at `temp` to `path`
///
/// The file is synced before the rename, so `path` either does not exist
/// or holds the complete content.
pub fn install(temp: &Path, path: &Path) -> StorageResult<()> {
    let file = fs::File::open(temp).map_err(|e| StorageError::from_io(e, temp.to_path_buf()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp.to_path_buf()))?;
    drop(file);

    fs::rename(temp, path).map_err(|e| StorageError::from_io(e, path.to_path_buf()))
}

/// Ensure the directory that will hold `path` exists
pub fn ensure_parent(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

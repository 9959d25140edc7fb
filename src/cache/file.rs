//! File-backed store
//!
//! One JSON document per key. File names are the BLAKE3 hash of the key, so
//! device ids never reach the filesystem unescaped. Writes go through a
//! temporary file in the same directory and are renamed into place.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

use super::{CacheEntry, KeyValueStore};
use crate::error::DetectorError;

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open the store, creating the directory if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = blake3::hash(key.as_bytes());
        self.dir.join(format!("{}.{EXTENSION}", digest.to_hex()))
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>, DetectorError> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        for item in read_dir {
            let path = item?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_entry(path: &Path, key: &str) -> Result<Option<CacheEntry>, DetectorError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry =
            serde_json::from_str(&text).map_err(|e| DetectorError::CacheCorrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(entry))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, DetectorError> {
        let Some(entry) = Self::read_entry(&self.path_for(key), key)? else {
            return Ok(None);
        };
        if entry.key != key {
            return Err(DetectorError::CacheCorrupt {
                key: key.to_string(),
                reason: format!("file holds entry for '{}'", entry.key),
            });
        }
        Ok(Some(entry))
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), DetectorError> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, entry)?;
        tmp.flush()?;
        tmp.persist(self.path_for(key)).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, DetectorError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, DetectorError> {
        let mut keys = Vec::new();
        for path in self.entry_files()? {
            let label = path.display().to_string();
            match Self::read_entry(&path, &label) {
                Ok(Some(entry)) => keys.push(entry.key),
                Ok(None) => {}
                Err(e) => warn!(path = %label, error = %e, "skipping unreadable cache file"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn retain(&self, keep: &dyn Fn(&CacheEntry) -> bool) -> Result<usize, DetectorError> {
        let mut removed = 0;
        for path in self.entry_files()? {
            let label = path.display().to_string();
            let drop = match Self::read_entry(&path, &label) {
                Ok(Some(entry)) => !keep(&entry),
                Ok(None) => false,
                Err(DetectorError::CacheCorrupt { reason, .. }) => {
                    warn!(path = %label, %reason, "removing undecodable cache file");
                    true
                }
                Err(e) => return Err(e),
            };
            if drop {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<usize, DetectorError> {
        let mut removed = 0;
        for path in self.entry_files()? {
            fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize, DetectorError> {
        Ok(self.entry_files()?.len())
    }
}

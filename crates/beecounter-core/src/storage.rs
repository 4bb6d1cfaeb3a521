//! Image storage and the persistent error log.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;

/// Public URL prefix under which stored images are listed.
pub const IMAGE_URL_PREFIX: &str = "/images/";

/// Size at which the error log is rotated.
pub const ERROR_LOG_MAX_BYTES: u64 = 10 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A persisted capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
}

/// Summary of the image directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub images: usize,
    pub bytes: u64,
}

/// Reject anything that is not a plain file name inside the image directory.
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    let invalid = name.is_empty()
        || name.len() > 64
        || name.starts_with('.')
        || name.contains("..")
        || name.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Directory of JPEG captures named `img-<unix-seconds>[-N].jpg`.
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "image store ready");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a JPEG under a name derived from `unix_secs`.
    ///
    /// Existing files are never overwritten; a `-N` suffix is added instead.
    pub fn save(&self, unix_secs: i64, jpeg: &[u8]) -> Result<StoredImage, StorageError> {
        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("img-{}.jpg", unix_secs)
            } else {
                format!("img-{}-{}.jpg", unix_secs, suffix)
            };
            let path = self.dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let written = file.write_all(jpeg).and_then(|()| file.sync_all());
                    if let Err(e) = written {
                        drop(file);
                        let _ = fs::remove_file(&path);
                        return Err(e.into());
                    }
                    info!(name = %name, bytes = jpeg.len(), "image saved");
                    return Ok(StoredImage {
                        path: format!("{}{}", IMAGE_URL_PREFIX, name),
                        name,
                        size_bytes: jpeg.len() as u64,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// All stored images, sorted by name.
    pub fn list(&self) -> Result<Vec<StoredImage>, StorageError> {
        let mut images = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_name(&name).is_err() || !name.ends_with(".jpg") {
                continue;
            }
            images.push(StoredImage {
                path: format!("{}{}", IMAGE_URL_PREFIX, name),
                name,
                size_bytes: meta.len(),
            });
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    fn existing_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.existing_path(name)?;
        Ok(fs::read(path)?)
    }

    pub fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.existing_path(name)?;
        fs::remove_file(path)?;
        info!(name, "image deleted");
        Ok(())
    }

    pub fn usage(&self) -> Result<StorageUsage, StorageError> {
        let images = self.list()?;
        Ok(StorageUsage {
            images: images.len(),
            bytes: images.iter().map(|i| i.size_bytes).sum(),
        })
    }
}

/// Append-only error log with single-generation rotation.
pub struct ErrorLog {
    path: PathBuf,
    max_bytes: u64,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl ErrorLog {
    pub fn new(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes: ERROR_LOG_MAX_BYTES,
            clock,
            lock: Mutex::new(()),
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Append one line. Returns `Ok(false)` when the wall clock is not set
    /// yet and nothing was written.
    pub fn append(&self, message: &str) -> Result<bool, StorageError> {
        error!(message, "device error");
        let Some(now) = self.clock.wall_time() else {
            warn!("wall clock not set; error not persisted");
            return Ok(false);
        };
        let _guard = self.lock.lock().map_err(|_| {
            StorageError::Io(io::Error::new(io::ErrorKind::Other, "error log lock poisoned"))
        })?;

        if let Ok(meta) = fs::metadata(&self.path) {
            if meta.len() > self.max_bytes {
                fs::rename(&self.path, self.backup_path())?;
                debug!(path = %self.path.display(), "error log rotated");
            }
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let stamp = now.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{} - {}", stamp, message)?;
        Ok(true)
    }

    /// Current log contents (without the rotated generation).
    pub fn contents(&self) -> Result<String, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the log and its backup.
    pub fn clear(&self) -> Result<(), StorageError> {
        for path in [self.path.clone(), self.backup_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

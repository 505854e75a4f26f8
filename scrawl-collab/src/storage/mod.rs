//! File-per-document persistence for the server.
//!
//! Layout of a storage directory:
//! ```text
//! <dir>/
//! ├── scrawl.lock          PID of the owning server
//! ├── doc-notes.json       "2\n" + JSON page list, one per document
//! ├── doc-a%2f;b.json
//! └── doc-old.save         legacy (bincode, no header); see `legacy`
//! ```
//!
//! Every write goes to a temporary file in the same directory which is then
//! renamed over the target, so readers only ever see complete files.

pub mod legacy;
pub mod lock;
pub mod naming;

use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use scrawl_core::format::{self, FormatError};
use scrawl_core::Page;
use thiserror::Error;

pub use legacy::{migrate_legacy, MigrationReport};
pub use lock::{LockError, LockFile, LOCK_FILE_NAME};

/// Where documents are stored.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub dir: PathBuf,
    /// Create `dir` if it does not exist. Only set for the default location;
    /// a mistyped explicit path should fail instead.
    pub create_if_missing: bool,
}

impl StorageConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            create_if_missing: false,
        }
    }

    /// The default location, created on first use.
    pub fn default_location(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            create_if_missing: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("cannot read {path}: {source}")]
    Format { path: PathBuf, source: FormatError },
    #[error("cannot convert legacy file {path}: {reason}")]
    Legacy { path: PathBuf, reason: String },
}

impl PersistenceError {
    fn io(path: &Path, source: io::Error) -> Self {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Open storage directory, held under lock for the server's lifetime.
#[derive(Debug)]
pub struct Persistence {
    dir: PathBuf,
    lock: LockFile,
}

impl Persistence {
    /// Prepare the directory and take its lock.
    pub fn open(config: &StorageConfig) -> Result<Self, PersistenceError> {
        let dir = &config.dir;
        if !dir.is_dir() {
            if !config.create_if_missing {
                return Err(PersistenceError::MissingDirectory(dir.clone()));
            }
            fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
            log::info!("Created storage directory {}", dir.display());
        }
        let lock = LockFile::acquire(dir)?;
        Ok(Self {
            dir: dir.clone(),
            lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(naming::file_name(name))
    }

    /// Read every stored document, sorted by name.
    ///
    /// Any unreadable file aborts loading: starting without it would let the
    /// next save of that name overwrite it.
    pub fn load_all(&self) -> Result<Vec<(String, Vec<Page>)>, PersistenceError> {
        let mut documents = Vec::new();
        let mut legacy = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))?;

        for entry in entries {
            let path = entry.map_err(|e| PersistenceError::io(&self.dir, e))?.path();
            if let Some(name) = naming::document_name(&path, naming::CURRENT_EXT) {
                let file = fs::File::open(&path).map_err(|e| PersistenceError::io(&path, e))?;
                let pages = format::read_pages(BufReader::new(file))
                    .map_err(|source| PersistenceError::Format {
                        path: path.clone(),
                        source,
                    })?;
                documents.push((name, pages));
            } else if let Some(name) = naming::document_name(&path, naming::LEGACY_EXT) {
                legacy.push(name);
            }
        }

        for name in legacy {
            if !documents.iter().any(|(n, _)| *n == name) {
                log::warn!(
                    "Document {name:?} is only stored in the legacy format and was not loaded; \
                     run the migrate command to convert it"
                );
            }
        }

        documents.sort_by(|a, b| a.0.cmp(&b.0));
        log::info!(
            "Loaded {} documents from {}",
            documents.len(),
            self.dir.display()
        );
        Ok(documents)
    }

    /// Atomically replace the stored pages of `name`.
    pub fn save(&self, name: &str, pages: &[Page]) -> Result<(), PersistenceError> {
        let target = self.path_for(name);
        let bytes = format::encode_pages(pages).map_err(|source| PersistenceError::Format {
            path: target.clone(),
            source,
        })?;
        write_atomic(&self.dir, &target, &bytes).map_err(|e| PersistenceError::io(&target, e))
    }

    /// Give up the directory.
    pub fn release(self) -> Result<(), PersistenceError> {
        self.lock.release()?;
        Ok(())
    }
}

/// Write `bytes` to a temporary file in `dir`, then rename it to `target`.
pub fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut temp = tempfile::Builder::new()
        .prefix(".doc-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

//! Offline conversion of version 1 document files.
//!
//! Version 1 stored each document as a bare bincode page list in
//! `doc-<name>.save`. Conversion writes the current format next to it and
//! leaves the original in place. It is never run by the server itself.

use std::fs;
use std::path::Path;

use scrawl_core::{Item, Page};

use super::lock::LockFile;
use super::{naming, write_atomic, PersistenceError};

/// Outcome of [`migrate_legacy`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Documents written in the current format.
    pub converted: Vec<String>,
    /// Documents that already had a current-format file.
    pub skipped: Vec<String>,
}

/// Encode pages the way version 1 did.
pub fn encode_legacy(pages: &[Page]) -> Result<Vec<u8>, PersistenceError> {
    bincode::serde::encode_to_vec(pages, bincode::config::standard()).map_err(|e| {
        PersistenceError::Legacy {
            path: Default::default(),
            reason: e.to_string(),
        }
    })
}

fn decode_legacy(path: &Path, bytes: &[u8]) -> Result<Vec<Page>, PersistenceError> {
    let (pages, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| PersistenceError::Legacy {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(pages)
}

/// Convert every legacy file in `dir` that has no current-format counterpart.
///
/// Takes the directory lock, so it refuses to run next to a live server.
pub fn migrate_legacy(dir: &Path) -> Result<MigrationReport, PersistenceError> {
    let lock = LockFile::acquire(dir)?;
    let mut report = MigrationReport::default();

    let mut sources = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| PersistenceError::io(dir, e))? {
        let path = entry.map_err(|e| PersistenceError::io(dir, e))?.path();
        if let Some(name) = naming::document_name(&path, naming::LEGACY_EXT) {
            sources.push((name, path));
        }
    }
    sources.sort();

    for (name, source) in sources {
        let target = dir.join(naming::file_name(&name));
        if target.exists() {
            log::info!(
                "Skipping {}: {} already exists",
                source.display(),
                target.display()
            );
            report.skipped.push(name);
            continue;
        }

        let bytes = fs::read(&source).map_err(|e| PersistenceError::io(&source, e))?;
        let mut pages = decode_legacy(&source, &bytes)?;
        let dropped = drop_non_finite(&mut pages);
        if dropped > 0 {
            log::warn!("Dropped {dropped} item(s) with non-finite numbers from {}", source.display());
        }
        let encoded = scrawl_core::format::encode_pages(&pages).map_err(|source| {
            PersistenceError::Format {
                path: target.clone(),
                source,
            }
        })?;
        write_atomic(dir, &target, &encoded).map_err(|e| PersistenceError::io(&target, e))?;
        log::info!("Converted {} -> {}", source.display(), target.display());
        report.converted.push(name);
    }

    lock.release()?;
    Ok(report)
}

/// The current format cannot hold NaN or infinity.
fn drop_non_finite(pages: &mut [Page]) -> usize {
    let mut dropped = 0;
    for page in pages {
        let before = page.items.len();
        page.items.retain(Item::is_finite);
        dropped += before - page.items.len();
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Persistence, StorageConfig};
    use scrawl_core::{Item, Point};

    fn pages() -> Vec<Page> {
        let mut page = Page::new();
        page.push(Item::circle(Point::new(5.0, 5.0), Point::new(6.0, 5.0)));
        vec![page, Page::new()]
    }

    #[test]
    fn test_converts_legacy_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(naming::legacy_file_name("old/doc")),
            encode_legacy(&pages()).unwrap(),
        )
        .unwrap();

        let report = migrate_legacy(dir.path()).unwrap();
        assert_eq!(report.converted, vec!["old/doc".to_string()]);
        assert!(report.skipped.is_empty());

        let store = Persistence::open(&StorageConfig::new(dir.path())).unwrap();
        assert_eq!(store.load_all().unwrap(), vec![("old/doc".to_string(), pages())]);
    }

    #[test]
    fn test_non_finite_items_dropped_on_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let mut legacy = pages();
        legacy[1].push(Item::stroke([Point::new(f64::NAN, 1.0)]));
        legacy[1].push(Item::rect(Point::new(0.0, 0.0), Point::new(1.0, 1.0)).with_width(f64::INFINITY));
        fs::write(
            dir.path().join(naming::legacy_file_name("doc")),
            encode_legacy(&legacy).unwrap(),
        )
        .unwrap();

        migrate_legacy(dir.path()).unwrap();
        let store = Persistence::open(&StorageConfig::new(dir.path())).unwrap();
        assert_eq!(store.load_all().unwrap(), vec![("doc".to_string(), pages())]);
    }

    #[test]
    fn test_existing_target_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(naming::legacy_file_name("doc")),
            encode_legacy(&pages()).unwrap(),
        )
        .unwrap();
        fs::write(dir.path().join(naming::file_name("doc")), "2\n[]").unwrap();

        let report = migrate_legacy(dir.path()).unwrap();
        assert_eq!(report.skipped, vec!["doc".to_string()]);
        assert_eq!(
            fs::read_to_string(dir.path().join(naming::file_name("doc"))).unwrap(),
            "2\n[]"
        );
    }

    #[test]
    fn test_refuses_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let _server = LockFile::acquire(dir.path()).unwrap();
        assert!(matches!(
            migrate_legacy(dir.path()),
            Err(PersistenceError::Lock(_))
        ));
    }

    #[test]
    fn test_corrupt_legacy_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(naming::legacy_file_name("x")), [0xFF; 3]).unwrap();
        assert!(matches!(
            migrate_legacy(dir.path()),
            Err(PersistenceError::Legacy { .. })
        ));
        // The lock was dropped with the error.
        assert!(!dir.path().join(crate::storage::LOCK_FILE_NAME).exists());
    }
}

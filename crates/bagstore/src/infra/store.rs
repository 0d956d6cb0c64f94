//! Bag file persistence: path resolution, creation, reading, atomic writes, and locking.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use serde_yaml::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::domain::errors::{BagError, ReadFailure, WriteFailure};
use crate::domain::model::{BagDocument, Fingerprint, Format};

/// Where a bag lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagLocation {
    directory: PathBuf,
    name: String,
    format: Format,
}

impl BagLocation {
    pub fn new(directory: impl Into<PathBuf>, name: impl Into<String>, format: Format) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
            format,
        }
    }

    /// Resolve a location from a raw extension, rejecting unsupported formats.
    pub fn resolve(
        directory: impl Into<PathBuf>,
        name: impl Into<String>,
        extension: &str,
    ) -> Result<Self, BagError> {
        let format = Format::from_extension(extension)?;
        Ok(Self::new(directory, name, format))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Full path of the bag file: `directory/name.extension`.
    pub fn path(&self) -> PathBuf {
        self.directory
            .join(format!("{}.{}", self.name, self.format.extension()))
    }

    /// Sidecar file used for advisory locking around saves.
    pub fn lock_path(&self) -> PathBuf {
        self.directory.join(format!(
            "{}.{}.lock",
            self.name,
            self.format.extension()
        ))
    }
}

/// A parsed bag file together with the fingerprint of what was read.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub document: BagDocument,
    pub fingerprint: Fingerprint,
}

/// Whether the bag file exists.
pub fn bag_exists(location: &BagLocation) -> bool {
    location.path().is_file()
}

/// Write an empty bag file if none exists yet, creating parent directories as needed.
///
/// The file appears with its full content or not at all, so a concurrent reader never sees it
/// empty.
///
/// Returns `true` when a new file was created.
pub fn create_bag(location: &BagLocation) -> Result<bool, BagError> {
    let path = location.path();
    let write_error = |source: WriteFailure| BagError::Write {
        path: path.clone(),
        source,
    };

    fs::create_dir_all(location.directory()).map_err(|err| write_error(err.into()))?;
    let rendered =
        serde_yaml::to_string(&BagDocument::empty()).map_err(|err| write_error(err.into()))?;

    let mut temp =
        NamedTempFile::new_in(location.directory()).map_err(|err| write_error(err.into()))?;
    temp.write_all(rendered.as_bytes())
        .map_err(|err| write_error(err.into()))?;
    match temp.persist_noclobber(&path) {
        Ok(_) => {}
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(write_error(err.into())),
    }

    info!(bag = location.name(), path = %path.display(), "created bag");
    Ok(true)
}

/// Read and parse the bag file in full.
pub fn read_document(location: &BagLocation) -> Result<LoadedDocument, BagError> {
    let path = location.path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(BagError::ResourceMissing { path });
        }
        Err(err) => {
            return Err(BagError::ResourceRead {
                path,
                source: err.into(),
            });
        }
    };

    let loaded = parse_document(&raw).map_err(|source| BagError::ResourceRead {
        path: path.clone(),
        source,
    })?;
    debug!(
        bag = location.name(),
        entries = loaded.document.data.len(),
        fingerprint = %loaded.fingerprint,
        "read bag file"
    );
    Ok(loaded)
}

/// Parse raw file content. The fingerprint covers the whole document, not only `data`.
pub fn parse_document(raw: &str) -> Result<LoadedDocument, ReadFailure> {
    let root: Value = serde_yaml::from_str(raw)?;
    let fingerprint = Fingerprint::of(&root)?;
    let document = BagDocument::from_root(root)?;
    Ok(LoadedDocument {
        document,
        fingerprint,
    })
}

/// Replace the bag file with `document`, returning the fingerprint of the written content.
///
/// Content goes to a temporary file in the same directory which is then renamed over the bag
/// file, so readers never observe a partial write.
pub fn write_document(
    location: &BagLocation,
    document: &BagDocument,
) -> Result<Fingerprint, BagError> {
    let path = location.path();
    let write_error = |source: WriteFailure| BagError::Write {
        path: path.clone(),
        source,
    };

    let rendered = serde_yaml::to_string(document).map_err(|err| write_error(err.into()))?;
    let written: Value =
        serde_yaml::from_str(&rendered).map_err(|err| write_error(err.into()))?;
    let fingerprint = Fingerprint::of(&written).map_err(|err| write_error(err.into()))?;

    let mut temp =
        NamedTempFile::new_in(location.directory()).map_err(|err| write_error(err.into()))?;
    temp.write_all(rendered.as_bytes())
        .map_err(|err| write_error(err.into()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| write_error(err.into()))?;
    // Temp files are created private; keep the mode of the file being replaced.
    if let Ok(existing) = fs::metadata(&path) {
        temp.as_file()
            .set_permissions(existing.permissions())
            .map_err(|err| write_error(err.into()))?;
    }
    temp.persist(&path).map_err(|err| write_error(err.into()))?;

    debug!(bag = location.name(), %fingerprint, "wrote bag file");
    Ok(fingerprint)
}

/// Names of the bags stored in `directory` for the given format, sorted.
pub fn list_bags(directory: &Path, format: Format) -> Result<Vec<String>, BagError> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(BagError::ResourceRead {
                path: directory.to_path_buf(),
                source: err.into(),
            });
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| BagError::ResourceRead {
            path: directory.to_path_buf(),
            source: err.into(),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches_format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(format.extension()));
        if !matches_format {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Exclusive advisory lock on a bag's sidecar lock file, released when dropped.
#[derive(Debug)]
pub struct BagLock {
    _file: File,
}

impl BagLock {
    /// Block until the exclusive lock is held.
    pub fn acquire(location: &BagLocation) -> Result<Self, BagError> {
        let path = location.lock_path();
        let lock_error = |source| BagError::Lock {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(location.directory()).map_err(lock_error)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_error)?;
        file.lock_exclusive().map_err(lock_error)?;
        Ok(Self { _file: file })
    }
}

//! Named key/value bags with change tracking and conflict-checked saves.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::app::env_export::{self, EnvExportOptions, ProcessEnv};
use crate::domain::errors::BagError;
use crate::domain::model::{BagDocument, Fingerprint, Format};
use crate::infra::config;
use crate::infra::store::{self, BagLocation, BagLock};

/// Options applied when opening a bag. Unset fields fall back to process defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BagOptions {
    /// Directory holding the bag file. Defaults to [`config::default_directory`].
    pub directory: Option<PathBuf>,
    /// Reject every mutation and save on the opened bag.
    pub read_only: bool,
    /// File extension, which selects the persistence format. Defaults to `yml`.
    pub extension: Option<String>,
}

impl BagOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }
}

/// A named set of key/value entries loaded from a bag file.
///
/// Mutations only touch memory. [`Bag::save`] writes them back, but refuses to do so when the
/// file changed on disk since this instance last read or wrote it.
///
/// A `Bag` is not meant to be shared between threads without external synchronization.
#[derive(Debug)]
pub struct Bag {
    location: BagLocation,
    read_only: bool,
    document: BagDocument,
    fingerprint: Fingerprint,
    dirty: bool,
}

impl Bag {
    /// Open the bag `name`, creating an empty bag file first when none exists.
    ///
    /// Read-only bags never write, so opening a missing bag read only fails with
    /// [`BagError::ResourceMissing`].
    pub fn open(name: impl Into<String>, options: BagOptions) -> Result<Self, BagError> {
        let extension = options
            .extension
            .unwrap_or_else(|| Format::default().extension().to_owned());
        let directory = options
            .directory
            .unwrap_or_else(config::default_directory);
        let location = BagLocation::resolve(directory, name, &extension)?;

        if !options.read_only && !store::bag_exists(&location) {
            store::create_bag(&location)?;
        }

        let loaded = store::read_document(&location)?;
        debug!(
            bag = location.name(),
            format = location.format().as_str(),
            read_only = options.read_only,
            entries = loaded.document.data.len(),
            "opened bag"
        );

        Ok(Self {
            location,
            read_only: options.read_only,
            document: loaded.document,
            fingerprint: loaded.fingerprint,
            dirty: false,
        })
    }

    pub fn name(&self) -> &str {
        self.location.name()
    }

    /// Path of the backing bag file.
    pub fn path(&self) -> PathBuf {
        self.location.path()
    }

    pub fn location(&self) -> &BagLocation {
        &self.location
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether in-memory entries have changes not yet saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Fingerprint of the bag file as last read or written by this instance.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Opaque metadata section of the bag file.
    pub fn meta(&self) -> &Value {
        &self.document.meta
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.data.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.document.data.contains_key(key)
    }

    /// Insert or replace an entry. Marks the bag dirty even when the value is unchanged.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), BagError> {
        self.ensure_writable()?;
        self.document.data.insert(key.into(), value.into());
        self.dirty = true;
        Ok(())
    }

    /// Remove an entry, returning its value. Removing an absent key leaves the bag clean.
    pub fn delete(&mut self, key: &str) -> Result<Option<Value>, BagError> {
        self.ensure_writable()?;
        let removed = self.document.data.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        Ok(removed)
    }

    pub fn is_empty(&self) -> bool {
        self.document.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.document.data.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.document.data.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.document.data.iter()
    }

    /// Entries as a map, for serialization.
    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.document.data
    }

    /// Persist in-memory changes.
    ///
    /// A clean bag is not touched. Otherwise the bag file is re-read under an exclusive lock
    /// and, if its fingerprint no longer matches the one captured at the last load or save,
    /// [`BagError::Conflict`] is returned and nothing is written. Entries and the dirty flag
    /// are left as they were on any failure.
    pub fn save(&mut self) -> Result<(), BagError> {
        self.ensure_writable()?;
        if !self.dirty {
            debug!(bag = self.name(), "bag is clean, skipping save");
            return Ok(());
        }

        let _lock = BagLock::acquire(&self.location)?;

        if store::bag_exists(&self.location) {
            let current = store::read_document(&self.location)?;
            if current.fingerprint != self.fingerprint {
                warn!(
                    bag = self.name(),
                    expected = %self.fingerprint,
                    found = %current.fingerprint,
                    "bag file changed since it was loaded, refusing to save"
                );
                return Err(BagError::Conflict {
                    path: self.location.path(),
                    expected: self.fingerprint.clone(),
                    found: current.fingerprint,
                });
            }
        }

        self.fingerprint = store::write_document(&self.location, &self.document)?;
        self.dirty = false;
        info!(bag = self.name(), entries = self.len(), "saved bag");
        Ok(())
    }

    /// Re-read the bag file, discarding unsaved changes.
    pub fn reload(&mut self) -> Result<(), BagError> {
        let loaded = store::read_document(&self.location)?;
        if self.dirty {
            debug!(bag = self.name(), "discarding unsaved changes on reload");
        }
        self.document = loaded.document;
        self.fingerprint = loaded.fingerprint;
        self.dirty = false;
        Ok(())
    }

    /// Copy selected entries into the process environment, returning what was assigned.
    pub fn add_to_env(&self, options: &EnvExportOptions) -> BTreeMap<String, String> {
        env_export::export_to_env(self, options, &mut ProcessEnv)
    }

    /// Importing from other file formats is not supported.
    pub fn import(&mut self, _source: &Path) -> Result<(), BagError> {
        Err(BagError::NotSupported {
            operation: "import",
        })
    }

    /// Exporting to other file formats is not supported.
    pub fn export(&self, _destination: &Path) -> Result<(), BagError> {
        Err(BagError::NotSupported {
            operation: "export",
        })
    }

    fn ensure_writable(&self) -> Result<(), BagError> {
        if self.read_only {
            return Err(BagError::ReadOnlyViolation {
                name: self.name().to_owned(),
            });
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Bag {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    fn open(dir: &TempDir, name: &str) -> Bag {
        Bag::open(name, BagOptions::new().with_directory(dir.path())).unwrap()
    }

    #[test]
    fn open_creates_empty_bag() {
        let dir = tempfile::tempdir().unwrap();
        let bag = open(&dir, "fresh");

        assert!(bag.is_empty());
        assert!(!bag.is_dirty());
        assert!(bag.path().is_file());
        assert_eq!(bag.path(), dir.path().join("fresh.yml"));
    }

    #[test]
    fn open_loads_existing_entries_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("team.yml"),
            "meta:\n  owner: ops\ndata:\n  region: eu-west-1\n  replicas: 3\n",
        )
        .unwrap();

        let bag = open(&dir, "team");
        assert_eq!(bag.len(), 2);
        assert_eq!(bag.get("region"), Some(&Value::from("eu-west-1")));
        assert_eq!(bag.get("replicas"), Some(&Value::from(3)));
        assert_eq!(bag.meta()["owner"], Value::from("ops"));
    }

    #[test]
    fn open_rejects_unsupported_extension_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let options = BagOptions::new()
            .with_directory(dir.path().join("never-created"))
            .with_extension("json");

        let err = Bag::open("config", options).unwrap_err();
        assert!(matches!(err, BagError::FormatUnsupported { ref format } if format == "json"));
        assert!(!dir.path().join("never-created").exists());
    }

    #[test]
    fn open_reports_unparsable_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.yml"), "data: {unclosed\n").unwrap();

        let err = Bag::open("broken", BagOptions::new().with_directory(dir.path())).unwrap_err();
        assert!(matches!(err, BagError::ResourceRead { .. }));
    }

    #[test]
    fn read_only_open_of_missing_bag_does_not_create_it() {
        let dir = tempfile::tempdir().unwrap();
        let options = BagOptions::new().with_directory(dir.path()).read_only(true);

        let err = Bag::open("ghost", options).unwrap_err();
        assert!(matches!(err, BagError::ResourceMissing { .. }));
        assert!(!dir.path().join("ghost.yml").exists());
    }

    #[test]
    fn set_then_get_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "kv");

        bag.set("api_key", "s3cr3t").unwrap();
        assert_eq!(bag.get("api_key"), Some(&Value::from("s3cr3t")));
        assert!(bag.is_dirty());
        assert!(!bag.is_empty());
    }

    #[test]
    fn delete_present_and_absent_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "kv");
        bag.set("a", "1").unwrap();
        bag.save().unwrap();

        assert_eq!(bag.delete("missing").unwrap(), None);
        assert!(!bag.is_dirty());

        assert_eq!(bag.delete("a").unwrap(), Some(Value::from("1")));
        assert!(bag.is_dirty());
        assert!(bag.get("a").is_none());
    }

    #[test]
    fn read_only_bag_rejects_mutations_and_save() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = open(&dir, "locked");
            writer.set("keep", "me").unwrap();
            writer.save().unwrap();
        }
        let before = fs::read_to_string(dir.path().join("locked.yml")).unwrap();

        let options = BagOptions::new().with_directory(dir.path()).read_only(true);
        let mut bag = Bag::open("locked", options).unwrap();

        assert!(matches!(
            bag.set("x", "y"),
            Err(BagError::ReadOnlyViolation { .. })
        ));
        assert!(matches!(
            bag.delete("keep"),
            Err(BagError::ReadOnlyViolation { .. })
        ));
        assert!(matches!(
            bag.save(),
            Err(BagError::ReadOnlyViolation { .. })
        ));
        assert!(!bag.is_dirty());
        assert_eq!(bag.get("keep"), Some(&Value::from("me")));
        assert_eq!(
            fs::read_to_string(dir.path().join("locked.yml")).unwrap(),
            before
        );
    }

    #[test]
    fn clean_save_performs_no_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "clean");
        fs::remove_file(bag.path()).unwrap();
        let fingerprint = bag.fingerprint().clone();

        bag.save().unwrap();

        assert!(!bag.path().exists());
        assert!(!bag.location().lock_path().exists());
        assert_eq!(bag.fingerprint(), &fingerprint);
    }

    #[test]
    fn save_detects_external_modification() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "shared");
        let loaded = bag.fingerprint().clone();

        let external = "meta: {}\ndata:\n  other: writer\n";
        fs::write(bag.path(), external).unwrap();

        bag.set("x", "y").unwrap();
        let err = bag.save().unwrap_err();
        match err {
            BagError::Conflict {
                expected, found, ..
            } => {
                assert_eq!(expected, loaded);
                assert_ne!(found, loaded);
            }
            other => panic!("expected conflict, got {other}"),
        }

        assert_eq!(fs::read_to_string(bag.path()).unwrap(), external);
        assert_eq!(bag.get("x"), Some(&Value::from("y")));
        assert!(bag.is_dirty());
    }

    #[test]
    fn formatting_only_changes_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "formatted");

        fs::write(bag.path(), "# reformatted by hand\ndata: {}\nmeta: {}\n").unwrap();

        bag.set("x", "y").unwrap();
        bag.save().unwrap();
        assert!(!bag.is_dirty());
    }

    #[test]
    fn save_refreshes_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "refresh");
        let initial = bag.fingerprint().clone();

        bag.set("x", "y").unwrap();
        bag.save().unwrap();
        assert_ne!(bag.fingerprint(), &initial);
        assert!(!bag.is_dirty());

        bag.set("x", "z").unwrap();
        bag.save().unwrap();

        fs::write(bag.path(), "meta: {}\ndata: {x: outside}\n").unwrap();
        bag.set("x", "again").unwrap();
        assert!(bag.save().unwrap_err().is_conflict());
    }

    #[test]
    fn save_recreates_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "vanishing");
        fs::remove_file(bag.path()).unwrap();

        bag.set("x", "y").unwrap();
        bag.save().unwrap();

        let reopened = open(&dir, "vanishing");
        assert_eq!(reopened.get("x"), Some(&Value::from("y")));
    }

    #[test]
    fn save_preserves_meta() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("meta.yml"),
            "meta:\n  owner: ops\n  tags: [a, b]\ndata: {}\n",
        )
        .unwrap();

        let mut bag = open(&dir, "meta");
        bag.set("k", "v").unwrap();
        bag.save().unwrap();

        let reopened = open(&dir, "meta");
        assert_eq!(reopened.meta(), bag.meta());
        assert_eq!(reopened.fingerprint(), bag.fingerprint());
    }

    #[test]
    fn reload_discards_changes_and_picks_up_external_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "reload");
        bag.set("local", "change").unwrap();

        fs::write(bag.path(), "meta: {}\ndata: {remote: value}\n").unwrap();
        bag.reload().unwrap();

        assert!(!bag.is_dirty());
        assert!(bag.get("local").is_none());
        assert_eq!(bag.get("remote"), Some(&Value::from("value")));

        bag.set("local", "again").unwrap();
        bag.save().unwrap();
    }

    #[test]
    fn failed_write_keeps_changes_and_dirty_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "blocked");
        fs::remove_file(bag.path()).unwrap();
        fs::create_dir(bag.path()).unwrap();

        bag.set("x", "y").unwrap();
        let err = bag.save().unwrap_err();

        assert!(matches!(err, BagError::Write { .. }), "got {err}");
        assert!(bag.is_dirty());
        assert_eq!(bag.get("x"), Some(&Value::from("y")));
        assert!(bag.path().is_dir());
    }

    #[test]
    fn failed_lock_aborts_save_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "unlockable");
        let before = fs::read_to_string(bag.path()).unwrap();
        fs::create_dir(bag.location().lock_path()).unwrap();

        bag.set("x", "y").unwrap();
        let err = bag.save().unwrap_err();

        assert!(matches!(err, BagError::Lock { .. }), "got {err}");
        assert!(bag.is_dirty());
        assert_eq!(fs::read_to_string(bag.path()).unwrap(), before);
    }

    #[test]
    fn import_and_export_are_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "io");
        let target = dir.path().join("other.json");

        assert!(matches!(
            bag.import(&target),
            Err(BagError::NotSupported {
                operation: "import"
            })
        ));
        assert!(matches!(
            bag.export(&target),
            Err(BagError::NotSupported {
                operation: "export"
            })
        ));
    }

    #[test]
    fn iterates_entries_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = open(&dir, "iter");
        bag.set("b", "2").unwrap();
        bag.set("a", "1").unwrap();

        let keys: Vec<&str> = bag.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!((&bag).into_iter().count(), 2);
    }
}

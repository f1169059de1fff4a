use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use metadata::MetadataError;
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError, WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod classify;
pub mod folders;
pub mod history;
pub mod instruments;
pub mod resolver;
pub mod scan;
pub mod songs;

pub use classify::{classify, collect_abc_files, RootSet};
pub use folders::{included_in_export, ConfiguredRoots, ExportExcludeRule, FolderRoots, FolderRuleUpdate};
pub use resolver::{identity, DuplicateDecision, DuplicatePolicy};
pub use scan::{CatalogStore, EmptyRootsPolicy, RootSource, ScanReport, Scanner};
pub use songs::{LibraryFilter, LibrarySongRow};

const CATALOG_VERSION: u32 = 1;
const KEY_SEP: char = '\x1f';

pub(crate) const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
pub(crate) const SONGS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("songs");
pub(crate) const SONGS_BY_IDENTITY_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("songs_by_identity");
pub(crate) const SONG_FILES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("song_files");
pub(crate) const SONG_FILES_BY_SONG_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("song_files_by_song");
pub(crate) const INSTRUMENTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("instruments");
pub(crate) const INSTRUMENTS_BY_NAME_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("instruments_by_name");
pub(crate) const STATUSES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("statuses");
pub(crate) const FOLDER_RULES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("folder_rules");
pub(crate) const PLAY_LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("play_log");
pub(crate) const SETLISTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("setlists");
pub(crate) const SETLIST_ITEMS_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("setlist_items");
pub(crate) const SETLIST_BAND_ASSIGNMENTS_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("setlist_band_assignments");
pub(crate) const SONG_LAYOUTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("song_layouts");
pub(crate) const SONG_LAYOUT_ASSIGNMENTS_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("song_layout_assignments");

const META_VERSION_KEY: &str = "version";

/// The persisted catalog. Cheap to clone; every mutation commits its own
/// write transaction.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        let db = Self::open_db(path)?;
        Self::with_db(db)
    }

    pub fn with_db(db: Arc<Database>) -> Result<Self, LibraryError> {
        let catalog = Self { db };
        match read_version(&catalog.db)? {
            Some(version) if version == CATALOG_VERSION => {}
            Some(version) => return Err(LibraryError::VersionMismatch(version)),
            None => {
                info!("Initialising empty catalog");
                catalog.init_tables()?;
            }
        }
        catalog.seed_default_statuses()?;
        Ok(catalog)
    }

    pub fn open_db(path: &Path) -> Result<Arc<Database>, LibraryError> {
        let db = open_or_create_db(path)?;
        Ok(Arc::new(db))
    }

    pub fn db(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    pub fn catalog_stats(&self) -> Result<CatalogStats, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let songs = read_txn.open_table(SONGS_TABLE)?.len()? as usize;
        let song_files = read_txn.open_table(SONG_FILES_TABLE)?.len()? as usize;
        let instruments = read_txn.open_table(INSTRUMENTS_TABLE)?.len()? as usize;
        let play_log = read_txn.open_table(PLAY_LOG_TABLE)?.len()? as usize;
        Ok(CatalogStats {
            songs,
            song_files,
            instruments,
            play_log,
        })
    }

    fn init_tables(&self) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let version_bytes = encode_value(&CATALOG_VERSION)?;
            meta.insert(META_VERSION_KEY, version_bytes.as_slice())?;
            let _ = write_txn.open_table(SONGS_TABLE)?;
            let _ = write_txn.open_table(SONGS_BY_IDENTITY_TABLE)?;
            let _ = write_txn.open_table(SONG_FILES_TABLE)?;
            let _ = write_txn.open_table(SONG_FILES_BY_SONG_TABLE)?;
            let _ = write_txn.open_table(INSTRUMENTS_TABLE)?;
            let _ = write_txn.open_table(INSTRUMENTS_BY_NAME_TABLE)?;
            let _ = write_txn.open_table(STATUSES_TABLE)?;
            let _ = write_txn.open_table(FOLDER_RULES_TABLE)?;
            let _ = write_txn.open_table(PLAY_LOG_TABLE)?;
            let _ = write_txn.open_table(SETLISTS_TABLE)?;
            let _ = write_txn.open_table(SETLIST_ITEMS_TABLE)?;
            let _ = write_txn.open_table(SETLIST_BAND_ASSIGNMENTS_TABLE)?;
            let _ = write_txn.open_table(SONG_LAYOUTS_TABLE)?;
            let _ = write_txn.open_table(SONG_LAYOUT_ASSIGNMENTS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub songs: usize,
    pub song_files: usize,
    pub instruments: usize,
    pub play_log: usize,
}

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Metadata(MetadataError),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
    VersionMismatch(u32),
    NotFound(String),
    InvalidInput(String),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Metadata(err) => write!(f, "metadata error: {}", err),
            LibraryError::Redb(err) => write!(f, "db error: {}", err),
            LibraryError::Bincode(err) => write!(f, "bincode error: {}", err),
            LibraryError::KeyParse(value) => write!(f, "key parse error: {}", value),
            LibraryError::VersionMismatch(version) => {
                write!(f, "catalog version mismatch: {}", version)
            }
            LibraryError::NotFound(what) => write!(f, "not found: {}", what),
            LibraryError::InvalidInput(what) => write!(f, "invalid input: {}", what),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<MetadataError> for LibraryError {
    fn from(err: MetadataError) -> Self {
        LibraryError::Metadata(err)
    }
}

impl From<redb::Error> for LibraryError {
    fn from(err: redb::Error) -> Self {
        LibraryError::Redb(err)
    }
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn read_version(db: &Database) -> Result<Option<u32>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(META_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let version = match table.get(META_VERSION_KEY)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(version)
}

/// Allocates the next id from a per-entity counter in the meta table.
pub(crate) fn next_id(txn: &WriteTransaction, counter: &str) -> Result<u64, LibraryError> {
    let key = format!("next_id{}{}", KEY_SEP, counter);
    let mut meta = txn.open_table(META_TABLE)?;
    let current: u64 = match meta.get(key.as_str())? {
        Some(value) => decode_value(value.value())?,
        None => 1,
    };
    let bytes = encode_value(&(current + 1))?;
    meta.insert(key.as_str(), bytes.as_slice())?;
    Ok(current)
}

pub(crate) fn read_record<T: for<'de> Deserialize<'de>>(
    db: &Database,
    table: TableDefinition<u64, &[u8]>,
    id: u64,
) -> Result<Option<T>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(table)?;
    let record = match table.get(id)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(record)
}

pub(crate) fn read_all<T: for<'de> Deserialize<'de>>(
    db: &Database,
    table: TableDefinition<u64, &[u8]>,
) -> Result<Vec<T>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(table)?;
    let mut items = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        items.push(decode_value(entry.1.value())?);
    }
    Ok(items)
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

pub(crate) fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_string();
    end.push('\u{10ffff}');
    end
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Catalog;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    pub fn temp_catalog() -> (TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        (dir, catalog)
    }

    pub fn write_abc(dir: &Path, rel: &str, title: &str, composer: &str, parts: &[&str]) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut content = format!("%%song-title {}\n%%song-composer {}\n", title, composer);
        for (idx, made_for) in parts.iter().enumerate() {
            content.push_str(&format!(
                "X: {}\n%%part-name Part {}\n%%made-for {}\n",
                idx + 1,
                idx + 1,
                made_for
            ));
        }
        fs::write(&path, content).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_catalog;
    use super::*;

    #[test]
    fn reopening_keeps_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.redb");
        {
            let catalog = Catalog::open(&path).unwrap();
            catalog.resolve_instrument("Harp").unwrap();
        }
        let catalog = Catalog::open(&path).unwrap();
        assert_eq!(catalog.catalog_stats().unwrap().instruments, 1);
        assert_eq!(catalog.list_statuses().unwrap().len(), 3);
    }

    #[test]
    fn version_mismatch_is_reported() {
        let (_dir, catalog) = temp_catalog();
        let db = catalog.db();
        {
            let write_txn = db.begin_write().unwrap();
            {
                let mut meta = write_txn.open_table(META_TABLE).unwrap();
                let bytes = encode_value(&(CATALOG_VERSION + 1)).unwrap();
                meta.insert(META_VERSION_KEY, bytes.as_slice()).unwrap();
            }
            write_txn.commit().unwrap();
        }
        drop(catalog);
        match Catalog::with_db(db) {
            Err(LibraryError::VersionMismatch(version)) => assert_eq!(version, CATALOG_VERSION + 1),
            Err(err) => panic!("unexpected error: {}", err),
            Ok(_) => panic!("expected version mismatch"),
        }
    }

    #[test]
    fn ids_are_allocated_per_counter() {
        let (_dir, catalog) = temp_catalog();
        let write_txn = catalog.db.begin_write().unwrap();
        assert_eq!(next_id(&write_txn, "a").unwrap(), 1);
        assert_eq!(next_id(&write_txn, "a").unwrap(), 2);
        assert_eq!(next_id(&write_txn, "b").unwrap(), 1);
        write_txn.commit().unwrap();
    }
}

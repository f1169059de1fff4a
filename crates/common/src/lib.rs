use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const HASH_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub part_number: u32,
    pub part_name: Option<String>,
    pub instrument_id: Option<u64>,
}

/// Canonical catalog entry. Parts are embedded rather than stored in a table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    pub id: u64,
    pub title: String,
    pub composers: String,
    pub duration_seconds: Option<u32>,
    pub transcriber: Option<String>,
    pub rating: Option<u8>,
    pub status_id: Option<u64>,
    pub notes: Option<String>,
    pub lyrics: Option<String>,
    pub last_played_at: Option<u64>,
    pub total_plays: u32,
    pub parts: Vec<Part>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Song {
    pub fn identity(&self) -> SongIdentity {
        SongIdentity::new(&self.title, &self.composers, self.parts.len())
    }
}

/// Logical identity used to detect candidate duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SongIdentity {
    pub title: String,
    pub composers: String,
    pub part_count: usize,
}

impl SongIdentity {
    pub fn new(title: &str, composers: &str, part_count: usize) -> Self {
        Self {
            title: title.trim().to_lowercase(),
            composers: composers.trim().to_string(),
            part_count,
        }
    }
}

/// Mutually exclusive classification of a cataloged path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Primary,
    SetCopy,
    Excluded,
}

impl Zone {
    /// Persisted flag triple: (is_primary_library, is_set_copy, scan_excluded).
    pub fn flags(self) -> (bool, bool, bool) {
        match self {
            Zone::Primary => (true, false, false),
            Zone::SetCopy => (false, true, false),
            Zone::Excluded => (false, false, true),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub mtime_ms: Option<u64>,
    pub hash: Option<String>,
}

impl Fingerprint {
    pub fn of(path: &Path) -> Self {
        Self {
            mtime_ms: file_mtime_ms(path),
            hash: content_hash(path).ok(),
        }
    }
}

/// One physical file, keyed by its absolute path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongFile {
    pub file_path: String,
    pub song_id: u64,
    pub file_mtime: Option<u64>,
    pub file_hash: Option<String>,
    pub export_timestamp: Option<String>,
    pub is_primary_library: bool,
    pub is_set_copy: bool,
    pub scan_excluded: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SongFile {
    pub fn zone(&self) -> Zone {
        if self.scan_excluded {
            Zone::Excluded
        } else if self.is_set_copy {
            Zone::SetCopy
        } else {
            Zone::Primary
        }
    }

    pub fn set_zone(&mut self, zone: Zone) {
        let (primary, set_copy, excluded) = zone.flags();
        self.is_primary_library = primary;
        self.is_set_copy = set_copy;
        self.scan_excluded = excluded;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: u64,
    pub name: String,
    pub alternative_names: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Instrument {
    pub fn matches(&self, name: &str) -> bool {
        let needle = name.trim().to_lowercase();
        if self.name.trim().to_lowercase() == needle {
            return true;
        }
        match &self.alternative_names {
            Some(alts) => alts
                .split(',')
                .map(|alt| alt.trim().to_lowercase())
                .any(|alt| !alt.is_empty() && alt == needle),
            None => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    LibraryRoot,
    ExportRoot,
    Exclude,
}

impl RuleType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "library" | "library_root" => Some(RuleType::LibraryRoot),
            "export" | "export_root" | "set_root" => Some(RuleType::ExportRoot),
            "exclude" => Some(RuleType::Exclude),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::LibraryRoot => "library_root",
            RuleType::ExportRoot => "export_root",
            RuleType::Exclude => "exclude",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRule {
    pub id: u64,
    pub rule_type: RuleType,
    pub path: String,
    pub enabled: bool,
    /// Only read by the export writer; the scanner ignores it.
    pub include_in_export: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub id: u64,
    pub name: String,
    pub color: Option<String>,
    pub sort_order: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayLogEntry {
    pub id: u64,
    pub song_id: u64,
    pub played_at: u64,
    pub context_setlist_id: Option<u64>,
    pub context_note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setlist {
    pub id: u64,
    pub name: String,
    pub locked: bool,
    pub created_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetlistItem {
    pub id: u64,
    pub setlist_id: u64,
    pub song_id: u64,
    pub position: u32,
    pub song_layout_id: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetlistBandAssignment {
    pub id: u64,
    pub setlist_item_id: u64,
    pub player_id: u64,
    pub part_number: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongLayout {
    pub id: u64,
    pub song_id: u64,
    pub band_layout_id: u64,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongLayoutAssignment {
    pub id: u64,
    pub song_layout_id: u64,
    pub player_id: u64,
    pub part_number: Option<u32>,
}

/// Streams the file through blake3 and returns the hex digest.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn file_mtime_ms(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let since = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since.as_millis().min(u128::from(u64::MAX)) as u64)
}

/// Resolves symlinks and relative components. Falls back to the trimmed input
/// when the path cannot be resolved (missing file, permission error).
pub fn normalize_path(path: &Path) -> PathBuf {
    match fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(_) => PathBuf::from(path.to_string_lossy().trim()),
    }
}

/// Segment-aware prefix check on normalised paths.
pub fn path_is_under(path: &Path, prefix: &Path) -> bool {
    normalize_path(path).starts_with(normalize_path(prefix))
}

pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

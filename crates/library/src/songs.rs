use std::collections::{BTreeSet, HashMap, HashSet};

use common::{Fingerprint, Part, Setlist, SetlistItem, Song, SongFile, SongIdentity, Status, Zone};
use metadata::ParsedSong;
use redb::{ReadableTable, WriteTransaction};
use serde::Serialize;

use crate::history::purge_dependents;
use crate::instruments::resolve_in_txn;
use crate::{
    decode_value, encode_value, next_id, now_secs, prefix_end, prefix_key, read_record, Catalog,
    LibraryError, KEY_SEP, SETLISTS_TABLE, SETLIST_ITEMS_TABLE, SONGS_BY_IDENTITY_TABLE,
    SONGS_TABLE, SONG_FILES_BY_SONG_TABLE, SONG_FILES_TABLE, STATUSES_TABLE,
};

const SONG_COUNTER: &str = "songs";
const DEFAULT_LIBRARY_LIMIT: usize = 2000;

/// Filters for the main library view. Substring filters are case-insensitive.
#[derive(Clone, Debug)]
pub struct LibraryFilter {
    pub title: Option<String>,
    pub composer: Option<String>,
    pub transcriber: Option<String>,
    pub part_count_min: Option<usize>,
    pub part_count_max: Option<usize>,
    pub status_ids: Vec<u64>,
    pub limit: usize,
}

impl Default for LibraryFilter {
    fn default() -> Self {
        Self {
            title: None,
            composer: None,
            transcriber: None,
            part_count_min: None,
            part_count_max: None,
            status_ids: Vec::new(),
            limit: DEFAULT_LIBRARY_LIMIT,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LibrarySongRow {
    pub song: Song,
    pub part_count: usize,
    pub status_name: Option<String>,
    pub in_upcoming_set: bool,
}

impl Catalog {
    pub fn get_song(&self, song_id: u64) -> Result<Option<Song>, LibraryError> {
        read_record(&self.db, SONGS_TABLE, song_id)
    }

    pub fn song_file(&self, path: &str) -> Result<Option<SongFile>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SONG_FILES_TABLE)?;
        let file = match table.get(path)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(file)
    }

    pub fn song_files(&self, song_id: u64) -> Result<Vec<SongFile>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(SONG_FILES_BY_SONG_TABLE)?;
        let files = read_txn.open_table(SONG_FILES_TABLE)?;

        let prefix = song_prefix(song_id);
        let end = prefix_end(&prefix);
        let mut out = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let path = entry.1.value();
            let record = files.get(path)?.map(|value| value.value().to_vec());
            if let Some(bytes) = record {
                out.push(decode_value(&bytes)?);
            }
        }
        Ok(out)
    }

    /// Prefers a primary, non-excluded file; otherwise any file of the song.
    pub fn primary_file_for_song(&self, song_id: u64) -> Result<Option<String>, LibraryError> {
        let files = self.song_files(song_id)?;
        let preferred = files
            .iter()
            .find(|file| file.zone() == Zone::Primary)
            .or_else(|| files.first())
            .map(|file| file.file_path.clone());
        Ok(preferred)
    }

    pub fn song_for_file(&self, path: &str) -> Result<Option<Song>, LibraryError> {
        match self.song_file(path)? {
            Some(file) => self.get_song(file.song_id),
            None => Ok(None),
        }
    }

    pub fn find_songs_by_identity(&self, identity: &SongIdentity) -> Result<Vec<u64>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SONGS_BY_IDENTITY_TABLE)?;
        let prefix = identity_prefix(identity);
        let end = prefix_end(&prefix);
        let mut ids = Vec::new();
        for entry in table.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            ids.push(entry.1.value());
        }
        Ok(ids)
    }

    /// Creates or refreshes the song file at `path` and its song. An existing
    /// path overwrites the song's parsed metadata in place; a new path gets a
    /// new song. Returns the song id.
    pub fn upsert_song_file(
        &self,
        path: &str,
        parsed: &ParsedSong,
        fingerprint: &Fingerprint,
        zone: Zone,
    ) -> Result<u64, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let now = now_secs();
        let parts = resolve_parts(&write_txn, parsed)?;
        let existing = load_song_file(&write_txn, path)?;

        let existing_song = match &existing {
            Some(file) => load_song(&write_txn, file.song_id)?,
            None => None,
        };
        let stamp = match &existing {
            Some(file) if !source_changed(file, fingerprint) => None,
            _ => Some(now),
        };
        let song_id = match existing_song {
            Some(song) => refresh_song(&write_txn, song, parsed, parts, stamp)?,
            None => create_song(&write_txn, parsed, parts, now)?,
        };
        store_song_file(&write_txn, existing, path, song_id, parsed, fingerprint, zone, now)?;

        write_txn.commit()?;
        Ok(song_id)
    }

    /// Attaches `path` to an existing song without touching the song's
    /// metadata. Returns `false` when the song does not exist.
    pub fn link_song_file(
        &self,
        song_id: u64,
        path: &str,
        parsed: &ParsedSong,
        fingerprint: &Fingerprint,
        zone: Zone,
    ) -> Result<bool, LibraryError> {
        let write_txn = self.db.begin_write()?;
        if load_song(&write_txn, song_id)?.is_none() {
            return Ok(false);
        }
        let existing = load_song_file(&write_txn, path)?;
        store_song_file(
            &write_txn,
            existing,
            path,
            song_id,
            parsed,
            fingerprint,
            zone,
            now_secs(),
        )?;
        write_txn.commit()?;
        Ok(true)
    }

    pub fn remove_song_files_not_in(&self, seen: &HashSet<String>) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut files = write_txn.open_table(SONG_FILES_TABLE)?;
            let mut index = write_txn.open_table(SONG_FILES_BY_SONG_TABLE)?;

            let mut stale = Vec::new();
            for entry in files.iter()? {
                let entry = entry?;
                let path = entry.0.value();
                if seen.contains(path) {
                    continue;
                }
                let file: SongFile = decode_value(entry.1.value())?;
                stale.push((path.to_string(), file.song_id));
            }
            for (path, song_id) in &stale {
                files.remove(path.as_str())?;
                index.remove(song_file_key(*song_id, path).as_str())?;
            }
            stale.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Deletes songs that no longer have any file, and every play-log,
    /// setlist and layout record pointing at a song without files.
    pub fn remove_orphaned_songs(&self) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let live = live_song_ids(&write_txn)?;

            let mut orphans: Vec<Song> = Vec::new();
            {
                let mut songs = write_txn.open_table(SONGS_TABLE)?;
                for entry in songs.iter()? {
                    let entry = entry?;
                    if !live.contains(&entry.0.value()) {
                        orphans.push(decode_value(entry.1.value())?);
                    }
                }
                for song in &orphans {
                    songs.remove(song.id)?;
                }
            }
            {
                let mut identities = write_txn.open_table(SONGS_BY_IDENTITY_TABLE)?;
                for song in &orphans {
                    identities.remove(identity_key(&song.identity(), song.id).as_str())?;
                }
            }
            purge_dependents(&write_txn, &live)?;
            orphans.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Songs with at least one primary, non-excluded file, ordered by title.
    pub fn list_library_songs(&self, filter: &LibraryFilter) -> Result<Vec<LibrarySongRow>, LibraryError> {
        let read_txn = self.db.begin_read()?;

        let mut song_ids = BTreeSet::new();
        {
            let files = read_txn.open_table(SONG_FILES_TABLE)?;
            for entry in files.iter()? {
                let entry = entry?;
                let file: SongFile = decode_value(entry.1.value())?;
                if file.zone() == Zone::Primary {
                    song_ids.insert(file.song_id);
                }
            }
        }

        let mut status_names: HashMap<u64, String> = HashMap::new();
        {
            let statuses = read_txn.open_table(STATUSES_TABLE)?;
            for entry in statuses.iter()? {
                let entry = entry?;
                let status: Status = decode_value(entry.1.value())?;
                status_names.insert(status.id, status.name);
            }
        }

        let mut upcoming = HashSet::new();
        {
            let setlists = read_txn.open_table(SETLISTS_TABLE)?;
            let mut open_setlists = HashSet::new();
            for entry in setlists.iter()? {
                let entry = entry?;
                let setlist: Setlist = decode_value(entry.1.value())?;
                if !setlist.locked {
                    open_setlists.insert(setlist.id);
                }
            }
            let items = read_txn.open_table(SETLIST_ITEMS_TABLE)?;
            for entry in items.iter()? {
                let entry = entry?;
                let item: SetlistItem = decode_value(entry.1.value())?;
                if open_setlists.contains(&item.setlist_id) {
                    upcoming.insert(item.song_id);
                }
            }
        }

        let title = lowered(&filter.title);
        let composer = lowered(&filter.composer);
        let transcriber = lowered(&filter.transcriber);

        let songs = read_txn.open_table(SONGS_TABLE)?;
        let mut rows = Vec::new();
        for song_id in song_ids {
            let song: Song = match songs.get(song_id)? {
                Some(value) => decode_value(value.value())?,
                None => continue,
            };
            if let Some(needle) = &title {
                if !song.title.to_lowercase().contains(needle) {
                    continue;
                }
            }
            if let Some(needle) = &composer {
                if !song.composers.to_lowercase().contains(needle) {
                    continue;
                }
            }
            if let Some(needle) = &transcriber {
                let matches = song
                    .transcriber
                    .as_ref()
                    .map(|value| value.to_lowercase().contains(needle))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            let part_count = song.parts.len();
            if filter.part_count_min.map(|min| part_count < min).unwrap_or(false) {
                continue;
            }
            if filter.part_count_max.map(|max| part_count > max).unwrap_or(false) {
                continue;
            }
            if !filter.status_ids.is_empty()
                && !song
                    .status_id
                    .map(|id| filter.status_ids.contains(&id))
                    .unwrap_or(false)
            {
                continue;
            }
            rows.push(LibrarySongRow {
                status_name: song.status_id.and_then(|id| status_names.get(&id).cloned()),
                in_upcoming_set: upcoming.contains(&song.id),
                part_count,
                song,
            });
        }

        rows.sort_by(|a, b| {
            a.song
                .title
                .to_lowercase()
                .cmp(&b.song.title.to_lowercase())
                .then_with(|| a.song.id.cmp(&b.song.id))
        });
        rows.truncate(filter.limit);
        Ok(rows)
    }
}

fn resolve_parts(txn: &WriteTransaction, parsed: &ParsedSong) -> Result<Vec<Part>, LibraryError> {
    let mut parts = Vec::with_capacity(parsed.parts.len());
    for info in &parsed.parts {
        let instrument_id = match &info.made_for {
            Some(made_for) => Some(resolve_in_txn(txn, made_for)?),
            None => None,
        };
        parts.push(Part {
            part_number: info.part_number,
            part_name: info.part_name.clone(),
            instrument_id,
        });
    }
    Ok(parts)
}

fn load_song(txn: &WriteTransaction, song_id: u64) -> Result<Option<Song>, LibraryError> {
    let table = txn.open_table(SONGS_TABLE)?;
    let song = match table.get(song_id)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(song)
}

fn load_song_file(txn: &WriteTransaction, path: &str) -> Result<Option<SongFile>, LibraryError> {
    let table = txn.open_table(SONG_FILES_TABLE)?;
    let file = match table.get(path)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(file)
}

fn create_song(
    txn: &WriteTransaction,
    parsed: &ParsedSong,
    parts: Vec<Part>,
    now: u64,
) -> Result<u64, LibraryError> {
    let id = next_id(txn, SONG_COUNTER)?;
    let song = Song {
        id,
        title: parsed.title.clone(),
        composers: parsed.composers.clone(),
        duration_seconds: parsed.duration_seconds,
        transcriber: parsed.transcriber.clone(),
        rating: None,
        status_id: None,
        notes: None,
        lyrics: None,
        last_played_at: None,
        total_plays: 0,
        parts,
        created_at: now,
        updated_at: now,
    };
    store_song(txn, &song)?;
    let mut identities = txn.open_table(SONGS_BY_IDENTITY_TABLE)?;
    identities.insert(identity_key(&song.identity(), id).as_str(), id)?;
    Ok(id)
}

// Last write wins; the record is only rewritten when a parsed field changed.
// `updated_at` moves only when `stamp` is given, i.e. the file itself changed,
// so songs shared by differing linked files settle after one rescan.
fn refresh_song(
    txn: &WriteTransaction,
    song: Song,
    parsed: &ParsedSong,
    parts: Vec<Part>,
    stamp: Option<u64>,
) -> Result<u64, LibraryError> {
    let mut next = song.clone();
    next.title = parsed.title.clone();
    next.composers = parsed.composers.clone();
    next.duration_seconds = parsed.duration_seconds;
    next.transcriber = parsed.transcriber.clone();
    next.parts = parts;
    if next == song {
        return Ok(song.id);
    }
    if let Some(now) = stamp {
        next.updated_at = now;
    }
    store_song(txn, &next)?;

    let old_identity = song.identity();
    let new_identity = next.identity();
    if old_identity != new_identity {
        let mut identities = txn.open_table(SONGS_BY_IDENTITY_TABLE)?;
        identities.remove(identity_key(&old_identity, song.id).as_str())?;
        identities.insert(identity_key(&new_identity, song.id).as_str(), song.id)?;
    }
    Ok(song.id)
}

/// Compares by content hash when both sides have one, else by mtime.
fn source_changed(previous: &SongFile, fingerprint: &Fingerprint) -> bool {
    match (&previous.file_hash, &fingerprint.hash) {
        (Some(before), Some(after)) => before != after,
        _ => previous.file_mtime != fingerprint.mtime_ms,
    }
}

fn store_song(txn: &WriteTransaction, song: &Song) -> Result<(), LibraryError> {
    let mut table = txn.open_table(SONGS_TABLE)?;
    let bytes = encode_value(song)?;
    table.insert(song.id, bytes.as_slice())?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn store_song_file(
    txn: &WriteTransaction,
    existing: Option<SongFile>,
    path: &str,
    song_id: u64,
    parsed: &ParsedSong,
    fingerprint: &Fingerprint,
    zone: Zone,
    now: u64,
) -> Result<(), LibraryError> {
    let mut record = match &existing {
        Some(file) => file.clone(),
        None => SongFile {
            file_path: path.to_string(),
            song_id,
            file_mtime: None,
            file_hash: None,
            export_timestamp: None,
            is_primary_library: true,
            is_set_copy: false,
            scan_excluded: false,
            created_at: now,
            updated_at: now,
        },
    };
    record.song_id = song_id;
    record.file_mtime = fingerprint.mtime_ms;
    record.file_hash = fingerprint.hash.clone();
    record.export_timestamp = parsed.export_timestamp.clone();
    record.set_zone(zone);

    if existing.as_ref() == Some(&record) {
        return Ok(());
    }
    if existing.is_some() {
        record.updated_at = now;
    }

    {
        let mut files = txn.open_table(SONG_FILES_TABLE)?;
        let bytes = encode_value(&record)?;
        files.insert(path, bytes.as_slice())?;
    }
    let mut index = txn.open_table(SONG_FILES_BY_SONG_TABLE)?;
    if let Some(previous) = &existing {
        if previous.song_id != song_id {
            index.remove(song_file_key(previous.song_id, path).as_str())?;
        }
    }
    index.insert(song_file_key(song_id, path).as_str(), path)?;
    Ok(())
}

fn live_song_ids(txn: &WriteTransaction) -> Result<HashSet<u64>, LibraryError> {
    let index = txn.open_table(SONG_FILES_BY_SONG_TABLE)?;
    let mut live = HashSet::new();
    for entry in index.iter()? {
        let entry = entry?;
        let key = entry.0.value();
        let head = key
            .split(KEY_SEP)
            .next()
            .ok_or_else(|| LibraryError::KeyParse(key.to_string()))?;
        let song_id = head
            .parse::<u64>()
            .map_err(|_| LibraryError::KeyParse(key.to_string()))?;
        live.insert(song_id);
    }
    Ok(live)
}

fn lowered(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_lowercase)
}

fn identity_prefix(identity: &SongIdentity) -> String {
    let mut out = String::new();
    out.push_str(&identity.title);
    out.push(KEY_SEP);
    out.push_str(&identity.composers);
    out.push(KEY_SEP);
    out.push_str(&format!("{:06}", identity.part_count));
    out.push(KEY_SEP);
    out
}

fn identity_key(identity: &SongIdentity, song_id: u64) -> String {
    let mut out = identity_prefix(identity);
    out.push_str(&format!("{:020}", song_id));
    out
}

fn song_prefix(song_id: u64) -> String {
    prefix_key(&format!("{:020}", song_id))
}

fn song_file_key(song_id: u64, path: &str) -> String {
    let mut out = song_prefix(song_id);
    out.push_str(path);
    out
}

use std::collections::HashSet;

use common::{PlayLogEntry, Setlist, SetlistBandAssignment, SetlistItem, Song, SongLayout, SongLayoutAssignment};
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{
    decode_value, encode_value, next_id, now_secs, read_all, Catalog, LibraryError,
    PLAY_LOG_TABLE, SETLISTS_TABLE, SETLIST_BAND_ASSIGNMENTS_TABLE, SETLIST_ITEMS_TABLE,
    SONGS_TABLE, SONG_LAYOUTS_TABLE, SONG_LAYOUT_ASSIGNMENTS_TABLE,
};

impl Catalog {
    /// Records a play and bumps the song's play counters.
    pub fn log_play(
        &self,
        song_id: u64,
        context_setlist_id: Option<u64>,
        context_note: Option<&str>,
    ) -> Result<PlayLogEntry, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let now = now_secs();
        {
            let mut songs = write_txn.open_table(SONGS_TABLE)?;
            let mut song: Song = match songs.get(song_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(LibraryError::NotFound(format!("song {}", song_id))),
            };
            song.last_played_at = Some(now);
            song.total_plays = song.total_plays.saturating_add(1);
            let bytes = encode_value(&song)?;
            songs.insert(song_id, bytes.as_slice())?;
        }
        let entry = PlayLogEntry {
            id: next_id(&write_txn, "play_log")?,
            song_id,
            played_at: now,
            context_setlist_id,
            context_note: context_note.map(str::to_string),
        };
        insert_record(&write_txn, PLAY_LOG_TABLE, entry.id, &entry)?;
        write_txn.commit()?;
        Ok(entry)
    }

    /// Newest first.
    pub fn play_history(&self, song_id: u64) -> Result<Vec<PlayLogEntry>, LibraryError> {
        let mut entries: Vec<PlayLogEntry> = read_all(&self.db, PLAY_LOG_TABLE)?;
        entries.retain(|entry| entry.song_id == song_id);
        entries.sort_by(|a, b| (b.played_at, b.id).cmp(&(a.played_at, a.id)));
        Ok(entries)
    }

    pub fn create_setlist(&self, name: &str) -> Result<Setlist, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let setlist = Setlist {
            id: next_id(&write_txn, "setlists")?,
            name: name.trim().to_string(),
            locked: false,
            created_at: now_secs(),
        };
        insert_record(&write_txn, SETLISTS_TABLE, setlist.id, &setlist)?;
        write_txn.commit()?;
        Ok(setlist)
    }

    /// Locked setlists no longer count as upcoming in the library view.
    pub fn set_setlist_locked(&self, setlist_id: u64, locked: bool) -> Result<Setlist, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let mut setlist: Setlist = require(&write_txn, SETLISTS_TABLE, setlist_id, "setlist")?;
        setlist.locked = locked;
        insert_record(&write_txn, SETLISTS_TABLE, setlist_id, &setlist)?;
        write_txn.commit()?;
        Ok(setlist)
    }

    pub fn list_setlists(&self) -> Result<Vec<Setlist>, LibraryError> {
        read_all(&self.db, SETLISTS_TABLE)
    }

    pub fn add_setlist_item(
        &self,
        setlist_id: u64,
        song_id: u64,
        position: u32,
        song_layout_id: Option<u64>,
    ) -> Result<SetlistItem, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let _: Setlist = require(&write_txn, SETLISTS_TABLE, setlist_id, "setlist")?;
        let _: Song = require(&write_txn, SONGS_TABLE, song_id, "song")?;
        let item = SetlistItem {
            id: next_id(&write_txn, "setlist_items")?,
            setlist_id,
            song_id,
            position,
            song_layout_id,
        };
        insert_record(&write_txn, SETLIST_ITEMS_TABLE, item.id, &item)?;
        write_txn.commit()?;
        Ok(item)
    }

    pub fn setlist_items(&self, setlist_id: u64) -> Result<Vec<SetlistItem>, LibraryError> {
        let mut items: Vec<SetlistItem> = read_all(&self.db, SETLIST_ITEMS_TABLE)?;
        items.retain(|item| item.setlist_id == setlist_id);
        items.sort_by_key(|item| (item.position, item.id));
        Ok(items)
    }

    pub fn add_setlist_band_assignment(
        &self,
        setlist_item_id: u64,
        player_id: u64,
        part_number: Option<u32>,
    ) -> Result<SetlistBandAssignment, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let _: SetlistItem = require(&write_txn, SETLIST_ITEMS_TABLE, setlist_item_id, "setlist item")?;
        let assignment = SetlistBandAssignment {
            id: next_id(&write_txn, "setlist_band_assignments")?,
            setlist_item_id,
            player_id,
            part_number,
        };
        insert_record(&write_txn, SETLIST_BAND_ASSIGNMENTS_TABLE, assignment.id, &assignment)?;
        write_txn.commit()?;
        Ok(assignment)
    }

    pub fn setlist_band_assignments(
        &self,
        setlist_item_id: u64,
    ) -> Result<Vec<SetlistBandAssignment>, LibraryError> {
        let mut assignments: Vec<SetlistBandAssignment> =
            read_all(&self.db, SETLIST_BAND_ASSIGNMENTS_TABLE)?;
        assignments.retain(|assignment| assignment.setlist_item_id == setlist_item_id);
        Ok(assignments)
    }

    pub fn create_song_layout(
        &self,
        song_id: u64,
        band_layout_id: u64,
        name: Option<&str>,
    ) -> Result<SongLayout, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let _: Song = require(&write_txn, SONGS_TABLE, song_id, "song")?;
        let layout = SongLayout {
            id: next_id(&write_txn, "song_layouts")?,
            song_id,
            band_layout_id,
            name: name.map(str::to_string),
        };
        insert_record(&write_txn, SONG_LAYOUTS_TABLE, layout.id, &layout)?;
        write_txn.commit()?;
        Ok(layout)
    }

    pub fn song_layouts(&self, song_id: u64) -> Result<Vec<SongLayout>, LibraryError> {
        let mut layouts: Vec<SongLayout> = read_all(&self.db, SONG_LAYOUTS_TABLE)?;
        layouts.retain(|layout| layout.song_id == song_id);
        Ok(layouts)
    }

    pub fn add_song_layout_assignment(
        &self,
        song_layout_id: u64,
        player_id: u64,
        part_number: Option<u32>,
    ) -> Result<SongLayoutAssignment, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let _: SongLayout = require(&write_txn, SONG_LAYOUTS_TABLE, song_layout_id, "song layout")?;
        let assignment = SongLayoutAssignment {
            id: next_id(&write_txn, "song_layout_assignments")?,
            song_layout_id,
            player_id,
            part_number,
        };
        insert_record(&write_txn, SONG_LAYOUT_ASSIGNMENTS_TABLE, assignment.id, &assignment)?;
        write_txn.commit()?;
        Ok(assignment)
    }

    pub fn song_layout_assignments(
        &self,
        song_layout_id: u64,
    ) -> Result<Vec<SongLayoutAssignment>, LibraryError> {
        let mut assignments: Vec<SongLayoutAssignment> =
            read_all(&self.db, SONG_LAYOUT_ASSIGNMENTS_TABLE)?;
        assignments.retain(|assignment| assignment.song_layout_id == song_layout_id);
        Ok(assignments)
    }
}

/// Deletes every record that hangs off a song outside `live`: band
/// assignments, setlist items, layout assignments, layouts and play log.
pub(crate) fn purge_dependents(
    txn: &WriteTransaction,
    live: &HashSet<u64>,
) -> Result<(), LibraryError> {
    let items: Vec<SetlistItem> =
        remove_where(txn, SETLIST_ITEMS_TABLE, |item: &SetlistItem| !live.contains(&item.song_id))?;
    let item_ids: HashSet<u64> = items.iter().map(|item| item.id).collect();
    let band: Vec<SetlistBandAssignment> = remove_where(
        txn,
        SETLIST_BAND_ASSIGNMENTS_TABLE,
        |assignment: &SetlistBandAssignment| item_ids.contains(&assignment.setlist_item_id),
    )?;

    let layouts: Vec<SongLayout> =
        remove_where(txn, SONG_LAYOUTS_TABLE, |layout: &SongLayout| !live.contains(&layout.song_id))?;
    let layout_ids: HashSet<u64> = layouts.iter().map(|layout| layout.id).collect();
    let layout_assignments: Vec<SongLayoutAssignment> = remove_where(
        txn,
        SONG_LAYOUT_ASSIGNMENTS_TABLE,
        |assignment: &SongLayoutAssignment| layout_ids.contains(&assignment.song_layout_id),
    )?;

    let plays: Vec<PlayLogEntry> =
        remove_where(txn, PLAY_LOG_TABLE, |entry: &PlayLogEntry| !live.contains(&entry.song_id))?;

    if !(items.is_empty() && layouts.is_empty() && plays.is_empty()) {
        debug!(
            "Purged {} setlist items, {} band assignments, {} layouts, {} layout assignments, {} plays",
            items.len(),
            band.len(),
            layouts.len(),
            layout_assignments.len(),
            plays.len()
        );
    }
    Ok(())
}

fn remove_where<T, F>(
    txn: &WriteTransaction,
    table: TableDefinition<u64, &[u8]>,
    mut matches: F,
) -> Result<Vec<T>, LibraryError>
where
    T: DeserializeOwned,
    F: FnMut(&T) -> bool,
{
    let mut table = txn.open_table(table)?;
    let mut doomed = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        let record: T = decode_value(entry.1.value())?;
        if matches(&record) {
            doomed.push((entry.0.value(), record));
        }
    }
    for (id, _) in &doomed {
        table.remove(*id)?;
    }
    Ok(doomed.into_iter().map(|(_, record)| record).collect())
}

fn insert_record<T: Serialize>(
    txn: &WriteTransaction,
    table: TableDefinition<u64, &[u8]>,
    id: u64,
    record: &T,
) -> Result<(), LibraryError> {
    let mut table = txn.open_table(table)?;
    let bytes = encode_value(record)?;
    table.insert(id, bytes.as_slice())?;
    Ok(())
}

fn require<T: DeserializeOwned>(
    txn: &WriteTransaction,
    table: TableDefinition<u64, &[u8]>,
    id: u64,
    what: &str,
) -> Result<T, LibraryError> {
    let table = txn.open_table(table)?;
    let record = match table.get(id)? {
        Some(value) => decode_value(value.value())?,
        None => return Err(LibraryError::NotFound(format!("{} {}", what, id))),
    };
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_catalog;
    use common::{Fingerprint, Zone};
    use metadata::ParsedSong;

    fn add_song(catalog: &Catalog, path: &str, title: &str) -> u64 {
        let parsed = ParsedSong {
            title: title.to_string(),
            composers: "Trad.".to_string(),
            ..ParsedSong::default()
        };
        let fingerprint = Fingerprint {
            mtime_ms: None,
            hash: None,
        };
        catalog
            .upsert_song_file(path, &parsed, &fingerprint, Zone::Primary)
            .unwrap()
    }

    #[test]
    fn log_play_updates_counters() {
        let (_dir, catalog) = temp_catalog();
        let id = add_song(&catalog, "/m/a.abc", "Reel");
        catalog.log_play(id, None, Some("pub night")).unwrap();
        catalog.log_play(id, None, None).unwrap();
        let song = catalog.get_song(id).unwrap().unwrap();
        assert_eq!(song.total_plays, 2);
        assert!(song.last_played_at.is_some());
        let history = catalog.play_history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].id > history[1].id);
    }

    #[test]
    fn log_play_for_unknown_song_fails() {
        let (_dir, catalog) = temp_catalog();
        assert!(matches!(
            catalog.log_play(5, None, None),
            Err(LibraryError::NotFound(_))
        ));
    }

    #[test]
    fn setlist_items_are_ordered_by_position() {
        let (_dir, catalog) = temp_catalog();
        let a = add_song(&catalog, "/m/a.abc", "A");
        let b = add_song(&catalog, "/m/b.abc", "B");
        let setlist = catalog.create_setlist(" Friday ").unwrap();
        assert_eq!(setlist.name, "Friday");
        catalog.add_setlist_item(setlist.id, a, 2, None).unwrap();
        catalog.add_setlist_item(setlist.id, b, 1, None).unwrap();
        let songs: Vec<u64> = catalog
            .setlist_items(setlist.id)
            .unwrap()
            .iter()
            .map(|item| item.song_id)
            .collect();
        assert_eq!(songs, vec![b, a]);
        assert!(matches!(
            catalog.add_setlist_item(setlist.id, 999, 3, None),
            Err(LibraryError::NotFound(_))
        ));
    }

    #[test]
    fn purge_removes_everything_hanging_off_dead_songs() {
        let (_dir, catalog) = temp_catalog();
        let keep = add_song(&catalog, "/m/keep.abc", "Keep");
        let gone = add_song(&catalog, "/m/gone.abc", "Gone");
        let setlist = catalog.create_setlist("Set").unwrap();
        let keep_item = catalog.add_setlist_item(setlist.id, keep, 0, None).unwrap();
        let gone_item = catalog.add_setlist_item(setlist.id, gone, 1, None).unwrap();
        catalog.add_setlist_band_assignment(keep_item.id, 1, Some(1)).unwrap();
        catalog.add_setlist_band_assignment(gone_item.id, 1, Some(2)).unwrap();
        let layout = catalog.create_song_layout(gone, 3, Some("Quartet")).unwrap();
        catalog.add_song_layout_assignment(layout.id, 1, Some(1)).unwrap();
        catalog.log_play(gone, Some(setlist.id), None).unwrap();

        let live: HashSet<u64> = [keep].into_iter().collect();
        let db = catalog.db();
        let write_txn = db.begin_write().unwrap();
        purge_dependents(&write_txn, &live).unwrap();
        write_txn.commit().unwrap();

        assert_eq!(catalog.setlist_items(setlist.id).unwrap().len(), 1);
        assert_eq!(catalog.setlist_band_assignments(keep_item.id).unwrap().len(), 1);
        assert!(catalog.setlist_band_assignments(gone_item.id).unwrap().is_empty());
        assert!(catalog.song_layouts(gone).unwrap().is_empty());
        assert!(catalog.song_layout_assignments(layout.id).unwrap().is_empty());
        assert!(catalog.play_history(gone).unwrap().is_empty());
    }
}

use common::{Instrument, Status};
use redb::{ReadableTable, WriteTransaction};
use tracing::info;

use crate::{
    decode_value, encode_value, next_id, now_secs, read_all, read_record, Catalog, LibraryError,
    INSTRUMENTS_BY_NAME_TABLE, INSTRUMENTS_TABLE, STATUSES_TABLE,
};

const INSTRUMENT_COUNTER: &str = "instruments";
const STATUS_COUNTER: &str = "statuses";
const UNKNOWN_INSTRUMENT: &str = "Unknown";

const DEFAULT_STATUSES: [(&str, &str); 3] = [
    ("New", "#0044FF"),
    ("Testing", "#FF8800"),
    ("Ready", "#00FF00"),
];

impl Catalog {
    /// Finds the instrument for a `made-for` value, creating it when neither a
    /// name nor an alternative name matches.
    pub fn resolve_instrument(&self, name: &str) -> Result<u64, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let id = resolve_in_txn(&write_txn, name)?;
        write_txn.commit()?;
        Ok(id)
    }

    pub fn list_instruments(&self) -> Result<Vec<Instrument>, LibraryError> {
        let mut instruments: Vec<Instrument> = read_all(&self.db, INSTRUMENTS_TABLE)?;
        instruments.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(instruments)
    }

    pub fn instrument_name(&self, id: u64) -> Result<Option<String>, LibraryError> {
        let instrument: Option<Instrument> = read_record(&self.db, INSTRUMENTS_TABLE, id)?;
        Ok(instrument.map(|instrument| instrument.name))
    }

    /// Replaces the comma-separated alternative names of an instrument.
    pub fn set_alternative_names(
        &self,
        id: u64,
        alternative_names: Option<&str>,
    ) -> Result<Instrument, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let instrument = {
            let mut table = write_txn.open_table(INSTRUMENTS_TABLE)?;
            let mut instrument: Instrument = match table.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(LibraryError::NotFound(format!("instrument {}", id))),
            };
            instrument.alternative_names = alternative_names
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            instrument.updated_at = now_secs();
            let bytes = encode_value(&instrument)?;
            table.insert(id, bytes.as_slice())?;
            instrument
        };
        write_txn.commit()?;
        Ok(instrument)
    }

    pub fn list_statuses(&self) -> Result<Vec<Status>, LibraryError> {
        let mut statuses: Vec<Status> = read_all(&self.db, STATUSES_TABLE)?;
        statuses.sort_by_key(|status| (status.sort_order, status.id));
        Ok(statuses)
    }

    pub(crate) fn seed_default_statuses(&self) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        let empty = write_txn.open_table(STATUSES_TABLE)?.len()? == 0;
        if !empty {
            return Ok(());
        }
        for (order, (name, color)) in DEFAULT_STATUSES.iter().enumerate() {
            let id = next_id(&write_txn, STATUS_COUNTER)?;
            let status = Status {
                id,
                name: name.to_string(),
                color: Some(color.to_string()),
                sort_order: order as u32,
            };
            let bytes = encode_value(&status)?;
            let mut table = write_txn.open_table(STATUSES_TABLE)?;
            table.insert(id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        info!("Seeded {} default statuses", DEFAULT_STATUSES.len());
        Ok(())
    }
}

pub(crate) fn resolve_in_txn(txn: &WriteTransaction, name: &str) -> Result<u64, LibraryError> {
    let name = match name.trim() {
        "" => UNKNOWN_INSTRUMENT,
        trimmed => trimmed,
    };
    let name_key = name.to_lowercase();

    let by_exact_name = {
        let by_name = txn.open_table(INSTRUMENTS_BY_NAME_TABLE)?;
        let found = by_name.get(name_key.as_str())?.map(|id| id.value());
        found
    };
    if let Some(id) = by_exact_name {
        return Ok(id);
    }

    let by_alternative = {
        let table = txn.open_table(INSTRUMENTS_TABLE)?;
        let mut found = None;
        for entry in table.iter()? {
            let entry = entry?;
            let instrument: Instrument = decode_value(entry.1.value())?;
            if instrument.matches(name) {
                found = Some(instrument.id);
                break;
            }
        }
        found
    };
    if let Some(id) = by_alternative {
        return Ok(id);
    }

    let id = next_id(txn, INSTRUMENT_COUNTER)?;
    let now = now_secs();
    let instrument = Instrument {
        id,
        name: name.to_string(),
        alternative_names: None,
        created_at: now,
        updated_at: now,
    };
    {
        let mut table = txn.open_table(INSTRUMENTS_TABLE)?;
        let bytes = encode_value(&instrument)?;
        table.insert(id, bytes.as_slice())?;
    }
    let mut by_name = txn.open_table(INSTRUMENTS_BY_NAME_TABLE)?;
    by_name.insert(name_key.as_str(), id)?;
    info!("Created instrument {} ({})", name, id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_catalog;

    #[test]
    fn same_name_resolves_to_same_instrument() {
        let (_dir, catalog) = temp_catalog();
        let harp = catalog.resolve_instrument("Harp").unwrap();
        assert_eq!(catalog.resolve_instrument("  harp ").unwrap(), harp);
        assert_ne!(catalog.resolve_instrument("Lute").unwrap(), harp);
        assert_eq!(catalog.catalog_stats().unwrap().instruments, 2);
    }

    #[test]
    fn blank_name_becomes_unknown() {
        let (_dir, catalog) = temp_catalog();
        let id = catalog.resolve_instrument("   ").unwrap();
        assert_eq!(catalog.instrument_name(id).unwrap().as_deref(), Some("Unknown"));
    }

    #[test]
    fn alternative_names_resolve_to_existing_instrument() {
        let (_dir, catalog) = temp_catalog();
        let lute = catalog.resolve_instrument("Lute of Ages").unwrap();
        let updated = catalog.set_alternative_names(lute, Some("LoA, Ages Lute")).unwrap();
        assert_eq!(updated.alternative_names.as_deref(), Some("LoA, Ages Lute"));
        assert_eq!(catalog.resolve_instrument("loa").unwrap(), lute);
        assert_eq!(catalog.resolve_instrument("AGES LUTE").unwrap(), lute);
        assert_eq!(catalog.list_instruments().unwrap().len(), 1);
    }

    #[test]
    fn lookups_within_one_transaction_see_new_instruments() {
        let (_dir, catalog) = temp_catalog();
        let harp = catalog.resolve_instrument("Harp").unwrap();
        catalog.set_alternative_names(harp, Some("Lyre")).unwrap();

        let write_txn = catalog.db.begin_write().unwrap();
        let flute = resolve_in_txn(&write_txn, "Flute").unwrap();
        assert_eq!(resolve_in_txn(&write_txn, "FLUTE").unwrap(), flute);
        assert_eq!(resolve_in_txn(&write_txn, "lyre").unwrap(), harp);
        write_txn.commit().unwrap();
        assert_eq!(catalog.list_instruments().unwrap().len(), 2);
    }

    #[test]
    fn unknown_instrument_update_is_not_found() {
        let (_dir, catalog) = temp_catalog();
        assert!(matches!(
            catalog.set_alternative_names(42, Some("x")),
            Err(LibraryError::NotFound(_))
        ));
    }

    #[test]
    fn default_statuses_are_seeded_once() {
        let (_dir, catalog) = temp_catalog();
        catalog.seed_default_statuses().unwrap();
        let statuses = catalog.list_statuses().unwrap();
        let names: Vec<&str> = statuses.iter().map(|status| status.name.as_str()).collect();
        assert_eq!(names, vec!["New", "Testing", "Ready"]);
        assert_eq!(statuses[0].color.as_deref(), Some("#0044FF"));
    }
}

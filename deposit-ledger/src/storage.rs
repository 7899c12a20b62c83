//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `rows` - Deposit rows (key: row_id)
//! - `owner_index` - Rows per owner in sequence order (key: owner || 0 || seq || row_id)
//! - `tx_index` - Deposit transaction hash uniqueness (key: tx_hash, value: row_id)
//! - `reconciliations` - Applied reconciliation records (key: owner || 0 || applied_at || record_id)

use crate::{
    error::{Error, Result},
    types::{LedgerRow, OwnerKey, ReconciliationRecord, RowUpdate},
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use uuid::Uuid;

/// Column family names
const CF_ROWS: &str = "rows";
const CF_OWNER_INDEX: &str = "owner_index";
const CF_TX_INDEX: &str = "tx_index";
const CF_RECONCILIATIONS: &str = "reconciliations";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Rows are rewritten in place; level compaction keeps read amplification low
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ROWS, Self::cf_options_rows()),
            ColumnFamilyDescriptor::new(CF_OWNER_INDEX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_TX_INDEX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_RECONCILIATIONS, Self::cf_options_reconciliations()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened deposit ledger RocksDB");

        Ok(Self { db })
    }

    // Column family options

    fn cf_options_rows() -> Options {
        let mut opts = Options::default();
        // Rows are read on every reconciliation, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_reconciliations() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Row operations

    /// Insert a new row with its indices (atomic)
    ///
    /// Rejects a second row with the same deposit transaction hash.
    pub fn insert_row(&self, row: &LedgerRow) -> Result<()> {
        let cf_rows = self.cf_handle(CF_ROWS)?;
        let cf_owner = self.cf_handle(CF_OWNER_INDEX)?;
        let cf_tx = self.cf_handle(CF_TX_INDEX)?;

        if self.db.get_cf(cf_tx, row.tx_hash.as_bytes())?.is_some() {
            return Err(Error::InvalidInput(format!(
                "deposit with tx hash {} already recorded",
                row.tx_hash
            )));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_rows, row.id.as_bytes(), bincode::serialize(row)?);
        batch.put_cf(
            cf_owner,
            Self::owner_ordered_key(&row.owner, row.sequence_key, row.id),
            b"",
        );
        batch.put_cf(cf_tx, row.tx_hash.as_bytes(), row.id.as_bytes());
        self.db.write(batch)?;

        tracing::debug!(row_id = %row.id, owner = %row.owner, "Row inserted");

        Ok(())
    }

    /// Get row by ID
    pub fn get_row(&self, row_id: Uuid) -> Result<LedgerRow> {
        let cf = self.cf_handle(CF_ROWS)?;
        let value = self
            .db
            .get_cf(cf, row_id.as_bytes())?
            .ok_or(Error::RowNotFound(row_id))?;

        Ok(bincode::deserialize(&value)?)
    }

    /// Rows of one owner, ascending by sequence key
    pub fn list_by_owner(&self, owner: &OwnerKey) -> Result<Vec<LedgerRow>> {
        let cf_owner = self.cf_handle(CF_OWNER_INDEX)?;
        let prefix = Self::owner_prefix(owner);

        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf_owner, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }

            // Trailing 16 bytes = row_id
            let id_bytes: [u8; 16] = key[key.len() - 16..]
                .try_into()
                .map_err(|_| Error::Storage("Malformed owner index key".to_string()))?;
            rows.push(self.get_row(Uuid::from_bytes(id_bytes))?);
        }

        Ok(rows)
    }

    /// Rewrite several rows in one atomic batch
    ///
    /// Either every row is written or none is; an unknown row aborts the batch.
    pub fn apply_updates(&self, updates: &[(Uuid, RowUpdate)], at: DateTime<Utc>) -> Result<usize> {
        let cf_rows = self.cf_handle(CF_ROWS)?;
        let mut batch = WriteBatch::default();

        for (row_id, update) in updates {
            let mut row = self.get_row(*row_id)?;
            row.apply(update, at);
            batch.put_cf(cf_rows, row_id.as_bytes(), bincode::serialize(&row)?);
        }

        self.db.write(batch)?;

        tracing::debug!(rows = updates.len(), "Row updates committed");

        Ok(updates.len())
    }

    // Reconciliation records

    /// Store an applied reconciliation record
    pub fn put_reconciliation(&self, record: &ReconciliationRecord) -> Result<()> {
        let cf = self.cf_handle(CF_RECONCILIATIONS)?;
        let applied_nanos = record.applied_at.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let key = Self::owner_ordered_key(&record.owner, applied_nanos, record.record_id);
        self.db.put_cf(cf, key, bincode::serialize(record)?)?;

        tracing::info!(
            record_id = %record.record_id,
            owner = %record.owner,
            rows_updated = record.rows_updated,
            "Reconciliation recorded"
        );

        Ok(())
    }

    /// Reconciliation records of one owner, oldest first
    pub fn list_reconciliations(&self, owner: &OwnerKey) -> Result<Vec<ReconciliationRecord>> {
        let cf = self.cf_handle(CF_RECONCILIATIONS)?;
        let prefix = Self::owner_prefix(owner);

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push(bincode::deserialize(&value)?);
        }

        Ok(records)
    }

    // Index key helpers

    fn owner_prefix(owner: &OwnerKey) -> Vec<u8> {
        let mut key = owner.as_str().as_bytes().to_vec();
        key.push(0); // Separator
        key
    }

    fn owner_ordered_key(owner: &OwnerKey, sequence_key: i64, row_id: Uuid) -> Vec<u8> {
        let mut key = Self::owner_prefix(owner);
        // Flip the sign bit so negative keys sort before positive ones
        key.extend_from_slice(&((sequence_key as u64) ^ (1 << 63)).to_be_bytes());
        key.extend_from_slice(row_id.as_bytes());
        key
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let cf_rows = self.cf_handle(CF_ROWS)?;
        let cf_records = self.cf_handle(CF_RECONCILIATIONS)?;

        Ok(StorageStats {
            total_rows: self.approximate_count(cf_rows)?,
            total_reconciliations: self.approximate_count(cf_records)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

/// Storage statistics (RocksDB estimates)
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Estimated number of rows
    pub total_rows: u64,
    /// Estimated number of reconciliation records
    pub total_reconciliations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (config, temp_dir)
    }

    fn test_row(owner: &str, seq: i64, balance: Decimal) -> LedgerRow {
        LedgerRow {
            id: Uuid::now_v7(),
            owner: OwnerKey::new(owner),
            principal: balance,
            current_balance: balance,
            sequence_key: seq,
            accumulated_yield: dec!(0.1),
            tx_hash: format!("0x{}", Uuid::new_v4().simple()),
            chain_id: 1,
            last_reconciled_at: None,
        }
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        assert!(storage.db.cf_handle(CF_ROWS).is_some());
        assert!(storage.db.cf_handle(CF_OWNER_INDEX).is_some());
        assert!(storage.db.cf_handle(CF_RECONCILIATIONS).is_some());
    }

    #[test]
    fn test_insert_and_get_row() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let row = test_row("0xabc", 1, dec!(5));
        storage.insert_row(&row).unwrap();

        let retrieved = storage.get_row(row.id).unwrap();
        assert_eq!(retrieved, row);
    }

    #[test]
    fn test_missing_row() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let err = storage.get_row(Uuid::now_v7()).unwrap_err();
        assert!(matches!(err, Error::RowNotFound(_)));
    }

    #[test]
    fn test_duplicate_tx_hash_rejected() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let row = test_row("0xabc", 1, dec!(5));
        storage.insert_row(&row).unwrap();

        let mut dup = test_row("0xabc", 2, dec!(1));
        dup.tx_hash = row.tx_hash.clone();
        assert!(matches!(storage.insert_row(&dup), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_list_by_owner_sorted_and_isolated() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        // Inserted out of order, including a negative sequence key
        let late = test_row("0xabc", 300, dec!(3));
        let early = test_row("0xabc", -5, dec!(1));
        let middle = test_row("0xabc", 20, dec!(2));
        let other = test_row("0xabcd", 10, dec!(9));

        for row in [&late, &other, &early, &middle] {
            storage.insert_row(row).unwrap();
        }

        let rows = storage.list_by_owner(&OwnerKey::new("0xABC")).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, middle.id, late.id]);

        let rows = storage.list_by_owner(&OwnerKey::new("0xabcd")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, other.id);

        assert!(storage.list_by_owner(&OwnerKey::new("0xnobody")).unwrap().is_empty());
    }

    #[test]
    fn test_apply_updates_atomic() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let row = test_row("0xabc", 1, dec!(5));
        storage.insert_row(&row).unwrap();

        let now = Utc::now();

        // Unknown row aborts the whole batch
        let err = storage
            .apply_updates(
                &[
                    (row.id, RowUpdate::rebalance(dec!(1))),
                    (Uuid::now_v7(), RowUpdate::rebalance(dec!(1))),
                ],
                now,
            )
            .unwrap_err();
        assert!(matches!(err, Error::RowNotFound(_)));
        assert_eq!(storage.get_row(row.id).unwrap().current_balance, dec!(5));

        let written = storage
            .apply_updates(&[(row.id, RowUpdate::rebalance(dec!(2.5)))], now)
            .unwrap();
        assert_eq!(written, 1);

        let updated = storage.get_row(row.id).unwrap();
        assert_eq!(updated.current_balance, dec!(2.5));
        assert_eq!(updated.accumulated_yield, Decimal::ZERO);
        assert_eq!(updated.principal, dec!(5));
        assert!(updated.last_reconciled_at.is_some());
    }

    #[test]
    fn test_reconciliation_records() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let owner = OwnerKey::new("0xabc");
        let start = Utc::now();
        for rows_updated in 1..=3u32 {
            storage
                .put_reconciliation(&ReconciliationRecord {
                    record_id: Uuid::now_v7(),
                    owner: owner.clone(),
                    target: dec!(0.01),
                    old_total: dec!(0.05),
                    new_total: dec!(0.01),
                    rows_updated,
                    applied_at: start + chrono::Duration::seconds(rows_updated as i64),
                })
                .unwrap();
        }

        let records = storage.list_reconciliations(&owner).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].rows_updated, 1);
        assert_eq!(records[2].rows_updated, 3);
        assert!(storage
            .list_reconciliations(&OwnerKey::new("0xother"))
            .unwrap()
            .is_empty());
    }
}

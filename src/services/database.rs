//! Local metadata index using RocksDB.
//!
//! RocksDB provides crash safety through its LSM-tree architecture and
//! write-ahead log (WAL). All writes are atomic and durable.
//!
//! # Data Organization
//!
//! Uses column families to separate data types:
//! - `metadata`: one record per stored object, keyed
//!   `deviceId:measurementId:fileType` (the key IS the uniqueness
//!   constraint)
//! - `user_index`: secondary index `userId:objectKey` -> objectKey

use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options, WriteBatch};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::StoredMeasurement;

type DB = DBWithThreadMode<MultiThreaded>;

/// Column family names
const CF_METADATA: &str = "metadata";
const CF_USER_INDEX: &str = "user_index";

/// Embedded metadata index for the local storage backend
pub struct MetadataIndex {
    db: Arc<DB>,
    // Serializes check-then-insert so the slot key stays unique
    write_lock: Mutex<()>,
    db_path: PathBuf,
}

impl std::fmt::Debug for MetadataIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataIndex")
            .field("path", &self.db_path)
            .finish()
    }
}

impl MetadataIndex {
    /// Open (or create) the index at the given path
    pub fn new(db_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(db_path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Performance tuning
        opts.set_max_open_files(256);
        opts.set_keep_log_file_num(3);
        opts.set_max_total_wal_size(64 * 1024 * 1024); // 64MB
        opts.set_write_buffer_size(32 * 1024 * 1024); // 32MB
        opts.set_max_write_buffer_number(3);

        let cf_names = [CF_METADATA, CF_USER_INDEX];
        let cf_descriptors: Vec<_> = cf_names
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&opts, db_path, cf_descriptors)
            .map_err(|e| AppError::internal(format!("Failed to open RocksDB: {}", e)))?;

        info!(path = %db_path.display(), "Metadata index initialized (RocksDB)");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
            db_path: db_path.to_path_buf(),
        })
    }

    fn cf_metadata(&self) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db
            .cf_handle(CF_METADATA)
            .expect("CF metadata must exist")
    }

    fn cf_user_index(&self) -> Arc<rocksdb::BoundColumnFamily<'_>> {
        self.db
            .cf_handle(CF_USER_INDEX)
            .expect("CF user_index must exist")
    }

    /// Insert a record, failing with `Conflict` when its slot is taken.
    ///
    /// The check-then-insert runs under a process-wide write lock, which is
    /// enough because this index has exactly one writing process.
    pub fn insert_unique(&self, record: &StoredMeasurement) -> Result<()> {
        let key = record.key();
        let data = serde_json::to_vec(record)?;
        let user_key = format!("{}:{}", record.user_id, key);

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AppError::internal("metadata index write lock poisoned"))?;

        let existing = self
            .db
            .get_cf(&self.cf_metadata(), key.as_bytes())
            .map_err(|e| AppError::internal(format!("RocksDB read failed: {}", e)))?;

        if existing.is_some() {
            return Err(AppError::conflict(format!(
                "object already stored for {}",
                key
            )));
        }

        // Atomic batch write: record + user index entry
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf_metadata(), key.as_bytes(), &data);
        batch.put_cf(&self.cf_user_index(), user_key.as_bytes(), key.as_bytes());

        self.db
            .write(batch)
            .map_err(|e| AppError::internal(format!("RocksDB write failed: {}", e)))?;

        debug!(key = %key, "Inserted metadata record");
        Ok(())
    }

    /// Fetch a record by its slot key
    pub fn get(&self, key: &str) -> Result<Option<StoredMeasurement>> {
        match self
            .db
            .get_cf(&self.cf_metadata(), key.as_bytes())
            .map_err(|e| AppError::internal(format!("RocksDB read failed: {}", e)))?
        {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Whether a record occupies the slot key
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove a record and its user index entry; used to roll back a
    /// finalize whose object move failed
    pub fn remove(&self, key: &str) -> Result<bool> {
        let record = match self.get(key)? {
            Some(record) => record,
            None => return Ok(false),
        };

        let user_key = format!("{}:{}", record.user_id, key);

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf_metadata(), key.as_bytes());
        batch.delete_cf(&self.cf_user_index(), user_key.as_bytes());

        self.db
            .write(batch)
            .map_err(|e| AppError::internal(format!("RocksDB delete failed: {}", e)))?;

        Ok(true)
    }

    /// Slot keys of all objects stored by one user
    pub fn keys_by_user(&self, user_id: &str) -> Result<Vec<String>> {
        let prefix = format!("{}:", user_id);
        let mut keys = Vec::new();

        let iter = self.db.iterator_cf(
            &self.cf_user_index(),
            rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) =
                item.map_err(|e| AppError::internal(format!("RocksDB iterator error: {}", e)))?;

            if !key.starts_with(prefix.as_bytes()) {
                break;
            }

            keys.push(String::from_utf8_lossy(&value).into_owned());
        }

        Ok(keys)
    }

    /// Total number of stored records
    pub fn count(&self) -> Result<u64> {
        let mut count = 0u64;
        let iter = self
            .db
            .iterator_cf(&self.cf_metadata(), rocksdb::IteratorMode::Start);

        for item in iter {
            if item.is_ok() {
                count += 1;
            }
        }

        Ok(count)
    }
}

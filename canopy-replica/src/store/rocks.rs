//! RocksDB-backed document collection.
//!
//! Column families:
//! - `documents`: JSON documents keyed by `_id` (LZ4 compressed)
//! - `changes`  : one committed [`ChangeEvent`] per key, keyed by commit
//!   sequence number (8 bytes big-endian, LZ4 compressed JSON)
//!
//! Transactions are serialized by a commit mutex and written as a single
//! `WriteBatch`, so a document write and its change log entry land together.
//! Open change streams are woken through a `broadcast` channel and then read
//! the change log directly, so a lagging stream never loses events.
//!
//! Reference: Kleppmann, DDIA, Chapter 11 (Change Data Capture)

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{
    ChangeEvent, ChangeStream, Collection, DocumentSource, ResumeMarker, StoreError, StoreResult,
    Transaction, TransactionBody,
};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_CHANGES: &str = "changes";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CHANGES];

/// Pending wake-ups per stream before it falls back to rescanning the log.
const NOTICE_CAPACITY: usize = 1024;

/// Collection configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canopy_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Notice {
    Committed(u64),
    Closed,
}

struct Inner {
    /// RocksDB instance (single-threaded mode; commits are serialized anyway)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Sequence number the next commit will get. Starts at 1 so that
    /// marker 0 means "before every commit".
    next_seq: AtomicU64,
    commit: Mutex<()>,
    notices: broadcast::Sender<Notice>,
    closed: AtomicBool,
}

/// A [`Collection`] persisted in RocksDB.
///
/// Cloning is cheap; clones share the database.
#[derive(Clone)]
pub struct RocksCollection {
    inner: Arc<Inner>,
}

impl RocksCollection {
    /// Open the collection at the configured path, creating it if needed.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next_seq = Self::recover_sequence(&db);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        log::info!(
            "Opened collection at {} (next commit #{next_seq})",
            config.path.display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                config,
                next_seq: AtomicU64::new(next_seq),
                commit: Mutex::new(()),
                notices,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CHANGES => {
                // Append-only, read sequentially by streams
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// Recover the next commit sequence number from the change log.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_CHANGES) {
            Some(cf) => cf,
            None => return 1,
        };

        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => decode_seq(&key).map_or(1, |seq| seq + 1),
            _ => 1,
        }
    }

    /// Reject every further operation and end all open change streams.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            log::info!("Closing collection at {}", self.inner.config.path.display());
            let _ = self.inner.notices.send(Notice::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Marker of the most recent commit (0 if none).
    pub fn latest_marker(&self) -> ResumeMarker {
        ResumeMarker(self.inner.next_seq.load(Ordering::SeqCst).saturating_sub(1))
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> StoreResult<()> {
        self.inner.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }
}

impl Inner {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn read_change(&self, seq: u64) -> StoreResult<Option<ChangeEvent>> {
        let cf = self.cf(CF_CHANGES)?;
        match self.db.get_cf(&cf, seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn commit(&self, body: &mut TransactionBody<'_>) -> StoreResult<Option<ResumeMarker>> {
        self.check_open()?;
        let _guard = self
            .commit
            .lock()
            .map_err(|_| StoreError::Database("commit lock poisoned".into()))?;

        let mut txn = Transaction::new(self);
        body(&mut txn)?;
        if txn.is_empty() {
            return Ok(None);
        }
        let (writes, changes) = txn.into_parts();

        let seq = self.next_seq.load(Ordering::SeqCst);
        let event = ChangeEvent {
            marker: ResumeMarker(seq),
            changes,
        };

        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_changes = self.cf(CF_CHANGES)?;
        let mut batch = WriteBatch::default();
        for (id, document) in &writes {
            match document {
                Some(document) => batch.put_cf(&cf_docs, id.as_bytes(), encode(document)?),
                None => batch.delete_cf(&cf_docs, id.as_bytes()),
            }
        }
        batch.put_cf(&cf_changes, seq.to_be_bytes(), encode(&event)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        self.next_seq.store(seq + 1, Ordering::SeqCst);

        log::trace!("Committed #{seq}: {} changes", event.changes.len());
        // No subscribers is fine
        let _ = self.notices.send(Notice::Committed(seq));
        Ok(Some(event.marker))
    }
}

impl DocumentSource for Inner {
    fn load(&self, id: &str) -> StoreResult<Option<Value>> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_all(&self) -> StoreResult<Vec<Value>> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut documents = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            documents.push(decode(&value)?);
        }
        Ok(documents)
    }
}

impl Collection for RocksCollection {
    fn get(&self, id: &str) -> StoreResult<Option<Value>> {
        self.inner.check_open()?;
        self.inner.load(id)
    }

    fn all(&self) -> StoreResult<Vec<Value>> {
        self.inner.check_open()?;
        self.inner.load_all()
    }

    fn transact(&self, body: &mut TransactionBody<'_>) -> StoreResult<Option<ResumeMarker>> {
        self.inner.commit(body)
    }

    fn watch(&self, resume_after: Option<ResumeMarker>) -> StoreResult<Box<dyn ChangeStream>> {
        self.inner.check_open()?;
        // Subscribe before reading the position so no commit slips between
        let notices = self.inner.notices.subscribe();
        let next = self.inner.next_seq.load(Ordering::SeqCst);
        let marker = match resume_after {
            Some(marker) if marker.0 >= next => return Err(StoreError::UnknownMarker(marker)),
            Some(marker) => marker,
            None => ResumeMarker(next - 1),
        };
        Ok(Box::new(RocksChangeStream {
            inner: Arc::clone(&self.inner),
            position: marker.0 + 1,
            marker,
            notices,
        }))
    }
}

/// Commit stream over the `changes` column family.
pub struct RocksChangeStream {
    inner: Arc<Inner>,
    position: u64,
    marker: ResumeMarker,
    notices: broadcast::Receiver<Notice>,
}

#[async_trait]
impl ChangeStream for RocksChangeStream {
    async fn next(&mut self) -> StoreResult<ChangeEvent> {
        loop {
            if let Some(event) = self.try_next()? {
                return Ok(event);
            }
            match self.notices.recv().await {
                Ok(Notice::Committed(_)) | Err(RecvError::Lagged(_)) => continue,
                Ok(Notice::Closed) | Err(RecvError::Closed) => return Err(StoreError::Closed),
            }
        }
    }

    fn try_next(&mut self) -> StoreResult<Option<ChangeEvent>> {
        self.inner.check_open()?;
        match self.inner.read_change(self.position)? {
            Some(event) => {
                self.position += 1;
                self.marker = event.marker;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    fn resume_marker(&self) -> Option<ResumeMarker> {
        Some(self.marker)
    }
}

// ─── Encoding ─────────────────────────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    let bytes = serde_json::to_vec(value)?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(serde_json::from_slice(&raw)?)
}

fn decode_seq(key: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

//! RocksDB-backed message store.
//!
//! Single column family `messages`:
//! ```text
//! key   = room (8 bytes BE) ‖ timestamp (8 bytes BE) ‖ message id (utf-8)
//! value = bincode(StoredMessage)
//! ```
//! Big-endian keys make a forward prefix scan return one room's messages in
//! chronological order. Re-appending a message writes the same key, so
//! appends are idempotent.
//!
//! The inherent methods block on disk I/O. The [`MessageStore`] impl runs
//! them on tokio's blocking pool.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, SliceTransform,
    WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{MessageStore, StoreError, StoredMessage};
use crate::protocol::RoomId;

const CF_MESSAGES: &str = "messages";

/// Length of the room prefix in every key.
const ROOM_PREFIX_LEN: usize = 8;

/// Room prefix plus timestamp.
const KEY_HEADER_LEN: usize = 16;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("roomcast_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Small caches, given directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// RocksDB message store. Clones share the same database handle.
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: RocksConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let descriptor = ColumnFamilyDescriptor::new(CF_MESSAGES, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![descriptor],
        )?;

        log::info!("Message store opened at {}", config.path.display());
        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    fn cf_options(config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        // scans never cross a room boundary
        opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(ROOM_PREFIX_LEN));
        opts
    }

    fn cf(&self) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_MESSAGES)
            .ok_or_else(|| StoreError::Database(format!("missing column family {CF_MESSAGES}")))
    }

    fn message_key(room: RoomId, message: &StoredMessage) -> Vec<u8> {
        let id = message.id.as_str().as_bytes();
        let mut key = Vec::with_capacity(KEY_HEADER_LEN + id.len());
        key.extend_from_slice(&room.to_be_bytes());
        key.extend_from_slice(&message.timestamp.to_be_bytes());
        key.extend_from_slice(id);
        key
    }

    fn encode(message: &StoredMessage) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<StoredMessage, StoreError> {
        let (message, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(message)
    }

    /// Read one room's messages, oldest first.
    pub fn load_room(&self, room: RoomId) -> Result<Vec<StoredMessage>, StoreError> {
        let cf = self.cf()?;
        let prefix = room.to_be_bytes();
        let mut messages = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < KEY_HEADER_LEN || key[..ROOM_PREFIX_LEN] != prefix[..] {
                break;
            }
            messages.push(Self::decode(&value)?);
        }

        Ok(messages)
    }

    /// Write one message.
    pub fn append_message(&self, room: RoomId, message: &StoredMessage) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let key = Self::message_key(room, message);
        let value = Self::encode(message)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key, value, &write_opts)?;
        Ok(())
    }

    /// Number of messages stored for `room`.
    pub fn message_count(&self, room: RoomId) -> Result<usize, StoreError> {
        Ok(self.load_room(room)?.len())
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.flush_cf(cf)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

#[async_trait]
impl MessageStore for RocksStore {
    async fn load(&self, room: RoomId) -> Result<Vec<StoredMessage>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load_room(room))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    async fn append(&self, room: RoomId, message: StoredMessage) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.append_message(room, &message))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

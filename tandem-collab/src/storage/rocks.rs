//! RocksDB-backed repository.
//!
//! Column families:
//! - `records`    : internal id → bincode record, content LZ4 compressed
//! - `doc_index`  : doc_id → internal id
//! - `grants`     : internal id ++ grantee email → bincode grant
//! - `shared_with`: grantee email ++ 0x00 ++ internal id → ()
//! - `owners`     : owner id ++ internal id → ()
//!
//! Every mutation is a single `WriteBatch`, so a record and its indexes
//! never disagree.

use std::path::PathBuf;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::identity::{normalize_email, Identity};
use crate::repository::{
    check_email, newest_first, now_millis, DocumentRecord, DocumentRepository, DocumentSummary,
    RepositoryError, ShareGrant, ShareRepository,
};

const CF_RECORDS: &str = "records";
const CF_DOC_INDEX: &str = "doc_index";
const CF_GRANTS: &str = "grants";
const CF_SHARED_WITH: &str = "shared_with";
const CF_OWNERS: &str = "owners";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_DOC_INDEX, CF_GRANTS, CF_SHARED_WITH, CF_OWNERS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

/// Record as laid out on disk.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    id: Uuid,
    doc_id: String,
    title: String,
    /// LZ4, size prepended
    content: Vec<u8>,
    owner_id: Uuid,
    created_at: u64,
    updated_at: u64,
}

impl StoredRecord {
    fn pack(record: &DocumentRecord) -> Self {
        Self {
            id: record.id,
            doc_id: record.doc_id.clone(),
            title: record.title.clone(),
            content: lz4_flex::compress_prepend_size(record.content.as_bytes()),
            owner_id: record.owner_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn unpack(self) -> Result<DocumentRecord, RepositoryError> {
        let content = lz4_flex::decompress_size_prepended(&self.content)
            .map_err(|e| RepositoryError::Storage(format!("corrupt content of {}: {e}", self.doc_id)))?;
        let content = String::from_utf8(content)
            .map_err(|e| RepositoryError::Storage(format!("corrupt content of {}: {e}", self.doc_id)))?;
        Ok(DocumentRecord {
            id: self.id,
            doc_id: self.doc_id,
            title: self.title,
            content,
            owner_id: self.owner_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RepositoryError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| RepositoryError::Storage(format!("serialization error: {e}")))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, RepositoryError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| RepositoryError::Storage(format!("deserialization error: {e}")))?;
    Ok(value)
}

impl From<rocksdb::Error> for RepositoryError {
    fn from(e: rocksdb::Error) -> Self {
        RepositoryError::Storage(e.to_string())
    }
}

fn pair_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

fn shared_with_key(email: &str, document: Uuid) -> Vec<u8> {
    let mut key = pair_key(email.as_bytes(), &[0]);
    key.extend_from_slice(document.as_bytes());
    key
}

pub struct RocksRepository {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of records.
    write_lock: Mutex<()>,
}

impl RocksRepository {
    /// Open (or create) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, RepositoryError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Document store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Content is already LZ4 compressed.
            CF_RECORDS => opts.set_compression_type(DBCompressionType::None),
            CF_DOC_INDEX => opts.optimize_for_point_lookup((config.block_cache_size >> 20) as u64),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, RepositoryError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RepositoryError::Storage(format!("missing column family '{name}'")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), RepositoryError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn internal_id(&self, doc_id: &str) -> Result<Uuid, RepositoryError> {
        match self.db.get_cf(self.cf(CF_DOC_INDEX)?, doc_id.as_bytes())? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map_err(|e| RepositoryError::Storage(format!("corrupt index entry for {doc_id}: {e}"))),
            None => Err(RepositoryError::NotFound(doc_id.to_string())),
        }
    }

    fn load(&self, id: Uuid) -> Result<Option<DocumentRecord>, RepositoryError> {
        match self.db.get_cf(self.cf(CF_RECORDS)?, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode::<StoredRecord>(&bytes)?.unpack()?)),
            None => Ok(None),
        }
    }

    fn load_by_doc_id(&self, doc_id: &str) -> Result<DocumentRecord, RepositoryError> {
        let id = self.internal_id(doc_id)?;
        self.load(id)?
            .ok_or_else(|| RepositoryError::NotFound(doc_id.to_string()))
    }

    fn has_grant(&self, document: Uuid, email: &str) -> Result<bool, RepositoryError> {
        let key = pair_key(document.as_bytes(), normalize_email(email).as_bytes());
        Ok(self.db.get_cf(self.cf(CF_GRANTS)?, key)?.is_some())
    }

    fn put_record(&self, batch: &mut WriteBatch, record: &DocumentRecord) -> Result<(), RepositoryError> {
        batch.put_cf(self.cf(CF_RECORDS)?, record.id.as_bytes(), encode(&StoredRecord::pack(record))?);
        Ok(())
    }

    /// Keys of `cf` starting with `prefix`, suffix only.
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>, RepositoryError> {
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        let mut suffixes = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            suffixes.push(key[prefix.len()..].to_vec());
        }
        Ok(suffixes)
    }

    fn summaries(&self, ids: Vec<Vec<u8>>) -> Result<Vec<DocumentSummary>, RepositoryError> {
        let mut summaries = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = Uuid::from_slice(&raw)
                .map_err(|e| RepositoryError::Storage(format!("corrupt index key: {e}")))?;
            match self.load(id)? {
                Some(record) => summaries.push(record.summary()),
                None => log::warn!("Index points at missing record {id}"),
            }
        }
        newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn modify<F>(&self, doc_id: &str, change: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut DocumentRecord) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_by_doc_id(doc_id)?;
        change(&mut record);
        record.updated_at = now_millis();
        let mut batch = WriteBatch::default();
        self.put_record(&mut batch, &record)?;
        self.write(batch)
    }
}

#[async_trait]
impl DocumentRepository for RocksRepository {
    async fn create_document(&self, owner: &Identity, title: &str) -> Result<DocumentRecord, RepositoryError> {
        let record = DocumentRecord::new(owner, title);
        let _guard = self.write_lock.lock().await;

        let mut batch = WriteBatch::default();
        self.put_record(&mut batch, &record)?;
        batch.put_cf(self.cf(CF_DOC_INDEX)?, record.doc_id.as_bytes(), record.id.as_bytes());
        batch.put_cf(
            self.cf(CF_OWNERS)?,
            pair_key(owner.id.as_bytes(), record.id.as_bytes()),
            b"",
        );
        self.write(batch)?;
        log::debug!("Created document {} for {}", record.doc_id, owner.email);
        Ok(record)
    }

    async fn fetch_by_doc_id(&self, doc_id: &str, requester: &Identity) -> Result<DocumentRecord, RepositoryError> {
        let record = self.load_by_doc_id(doc_id)?;
        if record.owner_id != requester.id && !self.has_grant(record.id, &requester.email)? {
            return Err(RepositoryError::Forbidden(doc_id.to_string()));
        }
        Ok(record)
    }

    async fn update_content(&self, doc_id: &str, content: &str) -> Result<(), RepositoryError> {
        self.modify(doc_id, |record| record.content = content.to_string()).await
    }

    async fn update_title(&self, doc_id: &str, title: &str) -> Result<(), RepositoryError> {
        self.modify(doc_id, |record| record.title = title.to_string()).await
    }

    async fn list_owned(&self, owner_id: Uuid) -> Result<Vec<DocumentSummary>, RepositoryError> {
        let ids = self.scan_prefix(CF_OWNERS, owner_id.as_bytes())?;
        self.summaries(ids)
    }
}

#[async_trait]
impl ShareRepository for RocksRepository {
    async fn grant(&self, doc_id: &str, grantee_email: &str, grantor_email: &str) -> Result<ShareGrant, RepositoryError> {
        let grantee = check_email(grantee_email)?;
        let grantor = check_email(grantor_email)?;
        let _guard = self.write_lock.lock().await;

        let document = self.internal_id(doc_id)?;
        let key = pair_key(document.as_bytes(), grantee.as_bytes());
        if let Some(existing) = self.db.get_cf(self.cf(CF_GRANTS)?, &key)? {
            return decode(&existing);
        }

        let grant = ShareGrant {
            document,
            shared_with: grantee,
            shared_by: grantor,
            created_at: now_millis(),
        };
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_GRANTS)?, &key, encode(&grant)?);
        batch.put_cf(self.cf(CF_SHARED_WITH)?, shared_with_key(&grant.shared_with, document), b"");
        self.write(batch)?;
        log::info!("Shared {doc_id} with {}", grant.shared_with);
        Ok(grant)
    }

    async fn is_authorized(&self, doc_id: &str, identity: &Identity) -> Result<bool, RepositoryError> {
        let record = self.load_by_doc_id(doc_id)?;
        Ok(record.owner_id == identity.id || self.has_grant(record.id, &identity.email)?)
    }

    async fn list_shared_with(&self, email: &str) -> Result<Vec<DocumentSummary>, RepositoryError> {
        let prefix = pair_key(normalize_email(email).as_bytes(), &[0]);
        let ids = self.scan_prefix(CF_SHARED_WITH, &prefix)?;
        self.summaries(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RocksRepository {
        RocksRepository::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn who(email: &str) -> Identity {
        Identity::new(Uuid::new_v4(), email)
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(config.sync_writes);
        assert!(!StoreConfig::for_testing("x").sync_writes);
    }

    #[test]
    fn test_stored_record_compresses_content() {
        let owner = who("o@example.com");
        let mut record = DocumentRecord::new(&owner, "t");
        record.content = "lorem ipsum ".repeat(200);
        let stored = StoredRecord::pack(&record);
        assert!(stored.content.len() < record.content.len() / 4);
        assert_eq!(stored.unpack().unwrap(), record);
    }

    #[tokio::test]
    async fn test_create_fetch_update() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open(&dir);
        let owner = who("o@example.com");

        let record = repo.create_document(&owner, "Notes").await.unwrap();
        repo.update_content(&record.doc_id, "{\"type\":\"doc\"}").await.unwrap();
        repo.update_title(&record.doc_id, "Renamed").await.unwrap();

        let fetched = repo.fetch_by_doc_id(&record.doc_id, &owner).await.unwrap();
        assert_eq!(fetched.content, "{\"type\":\"doc\"}");
        assert_eq!(fetched.title, "Renamed");
        assert_eq!(fetched.id, record.id);
    }

    #[tokio::test]
    async fn test_missing_and_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open(&dir);
        let owner = who("o@example.com");
        let record = repo.create_document(&owner, "Notes").await.unwrap();

        assert!(matches!(
            repo.fetch_by_doc_id("nope", &owner).await,
            Err(RepositoryError::NotFound(_))
        ));
        assert!(matches!(
            repo.fetch_by_doc_id(&record.doc_id, &who("z@example.com")).await,
            Err(RepositoryError::Forbidden(_))
        ));
        assert!(matches!(
            repo.update_content("nope", "").await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_grants_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open(&dir);
        let owner = who("o@example.com");
        let a = repo.create_document(&owner, "A").await.unwrap();
        let b = repo.create_document(&owner, "B").await.unwrap();
        repo.create_document(&who("else@example.com"), "C").await.unwrap();

        repo.grant(&a.doc_id, "g@example.com", &owner.email).await.unwrap();
        repo.grant(&a.doc_id, "G@example.com", &owner.email).await.unwrap();
        repo.grant(&b.doc_id, "g@example.com", &owner.email).await.unwrap();

        let grantee = who("g@example.com");
        assert!(repo.is_authorized(&a.doc_id, &grantee).await.unwrap());
        assert_eq!(repo.list_shared_with("g@example.com").await.unwrap().len(), 2);
        assert_eq!(repo.list_owned(owner.id).await.unwrap().len(), 2);
        assert!(repo.grant(&a.doc_id, "not-an-email", &owner.email).await.is_err());
    }
}

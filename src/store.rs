//! Per-party append-only storage of account versions
use chrono::Utc;
use sled::{Batch, Db};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::account::{AccountId, AccountRecord, TimeStamp};
use crate::error::StoreError;

const VERSION_PREFIX: &str = "version/";
const CURRENT_PREFIX: &str = "current/";

/// One version as held by a party, with the transitions that produced and consumed it.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StoredVersion {
    #[n(0)]
    pub record: AccountRecord,
    #[n(1)]
    pub produced_by: String,
    #[n(2)]
    pub consumed_by: Option<String>,
    #[n(3)]
    pub recorded_at: TimeStamp<Utc>,
}

impl StoredVersion {
    pub fn is_consumed(&self) -> bool {
        self.consumed_by.is_some()
    }
}

/// Keyed store holding every version a party has been shown, with at most one
/// unconsumed version per account id.
pub trait RecordStore: Send + Sync {
    /// The unconsumed version for `id`, if this party holds one.
    fn current(&self, id: &AccountId) -> Result<Option<AccountRecord>, StoreError>;

    /// Every unconsumed version held.
    fn list_current(&self) -> Result<Vec<AccountRecord>, StoreError>;

    /// All versions held for `id`, oldest first.
    fn history(&self, id: &AccountId) -> Result<Vec<StoredVersion>, StoreError>;

    /// Atomically marks `consumed` as consumed by `tx_id` and stores `produced`
    /// as the new unconsumed version.
    fn record(
        &self,
        tx_id: &str,
        consumed: Option<&AccountRecord>,
        produced: Option<&AccountRecord>,
    ) -> Result<(), StoreError>;
}

pub struct SledRecordStore {
    instance: Arc<Db>,
    write_lock: Mutex<()>,
}

impl SledRecordStore {
    pub fn new(instance: Arc<Db>) -> Self {
        Self {
            instance,
            write_lock: Mutex::new(()),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self::new(Arc::new(db)))
    }

    fn current_key(id: &AccountId) -> String {
        format!("{CURRENT_PREFIX}{id}")
    }

    fn version_prefix(id: &AccountId) -> String {
        format!("{VERSION_PREFIX}{id}/")
    }

    fn load_version(&self, key: &[u8]) -> Result<Option<StoredVersion>, StoreError> {
        match self.instance.get(key)? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // key and contents of the unconsumed version for `id`
    fn current_entry(&self, id: &AccountId) -> Result<Option<(Vec<u8>, StoredVersion)>, StoreError> {
        let Some(version_key) = self.instance.get(Self::current_key(id))? else {
            return Ok(None);
        };
        let version = self
            .load_version(&version_key)?
            .ok_or_else(|| StoreError::Conflict(format!("dangling current pointer for {id}")))?;
        Ok(Some((version_key.to_vec(), version)))
    }

    fn encode(version: &StoredVersion) -> Result<Vec<u8>, StoreError> {
        minicbor::to_vec(version).map_err(|e| StoreError::Encode(e.to_string()))
    }
}

impl RecordStore for SledRecordStore {
    fn current(&self, id: &AccountId) -> Result<Option<AccountRecord>, StoreError> {
        Ok(self.current_entry(id)?.map(|(_, version)| version.record))
    }

    fn list_current(&self) -> Result<Vec<AccountRecord>, StoreError> {
        let mut records = vec![];
        for entry in self.instance.scan_prefix(CURRENT_PREFIX) {
            let (_, version_key) = entry?;
            if let Some(version) = self.load_version(&version_key)? {
                records.push(version.record);
            }
        }
        Ok(records)
    }

    fn history(&self, id: &AccountId) -> Result<Vec<StoredVersion>, StoreError> {
        self.instance
            .scan_prefix(Self::version_prefix(id))
            .map(|entry| -> Result<StoredVersion, StoreError> {
                let (_, bytes) = entry?;
                Ok(minicbor::decode(&bytes)?)
            })
            .collect()
    }

    fn record(
        &self,
        tx_id: &str,
        consumed: Option<&AccountRecord>,
        produced: Option<&AccountRecord>,
    ) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Conflict("store write lock poisoned".into()))?;

        let mut batch = Batch::default();

        if let Some(consumed) = consumed {
            let (key, mut version) = self
                .current_entry(consumed.id())?
                .filter(|(_, version)| &version.record == consumed)
                .ok_or_else(|| StoreError::Conflict(consumed.id().to_string()))?;

            version.consumed_by = Some(tx_id.to_string());
            batch.insert(key, Self::encode(&version)?);
            batch.remove(Self::current_key(consumed.id()).as_bytes());
        }

        if let Some(produced) = produced {
            let id = produced.id();
            // only the version consumed above may be replaced
            let replaces_current = consumed.is_some_and(|c| c.id() == id);
            if !replaces_current && self.instance.get(Self::current_key(id))?.is_some() {
                return Err(StoreError::Conflict(id.to_string()));
            }

            let prefix = Self::version_prefix(id);
            let seq = self.instance.scan_prefix(&prefix).count();
            let key = format!("{prefix}{seq:020}");
            let version = StoredVersion {
                record: produced.clone(),
                produced_by: tx_id.to_string(),
                consumed_by: None,
                recorded_at: TimeStamp::new(),
            };
            batch.insert(key.as_bytes(), Self::encode(&version)?);
            batch.insert(Self::current_key(id).as_bytes(), key.as_bytes());
        }

        self.instance.apply_batch(batch)?;
        tracing::debug!(
            tx_id,
            consumed = ?consumed.map(|r| r.id()),
            produced = ?produced.map(|r| r.id()),
            "recorded transition"
        );
        Ok(())
    }
}

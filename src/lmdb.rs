//! LMDB-backed state and timeout storage

use std::path::Path;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};

use crate::{
    CorrelationKey, SagaId, SagaInstance, StateStorage, StorageError, Timeout, TimeoutError,
    TimeoutId, TimeoutStore,
};

const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;

/// Durable storage for saga instances and pending timeouts.
///
/// Records are JSON encoded and keyed by their id. Each operation runs in its
/// own LMDB transaction, and LMDB allows a single writer at a time, which
/// gives the per-instance write exclusion the dispatcher expects.
pub struct LmdbStore {
    env: Env,
    instances: Database<Str, Bytes>,
    timeouts: Database<Str, Bytes>,
}

impl LmdbStore {
    /// Open or create a store in the existing directory `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, heed::Error> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    pub fn open_with_map_size(path: impl AsRef<Path>, map_size: usize) -> Result<Self, heed::Error> {
        // SAFETY: the environment is opened once per store and the files are
        // not modified by anything but LMDB.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(path.as_ref())?
        };

        let mut wtxn = env.write_txn()?;
        let instances = env.create_database(&mut wtxn, Some("saga_instances"))?;
        let timeouts = env.create_database(&mut wtxn, Some("saga_timeouts"))?;
        wtxn.commit()?;

        tracing::info!(path = %path.as_ref().display(), "lmdb saga store opened");
        Ok(Self {
            env,
            instances,
            timeouts,
        })
    }

    fn read_instances(&self) -> Result<Vec<SagaInstance>, StorageError> {
        let rtxn = self.env.read_txn().map_err(storage_err)?;
        let mut out = Vec::new();
        for entry in self.instances.iter(&rtxn).map_err(storage_err)? {
            let (_, bytes) = entry.map_err(storage_err)?;
            out.push(serde_json::from_slice(bytes).map_err(|e| StorageError::Codec(e.to_string().into()))?);
        }
        Ok(out)
    }

    fn read_timeouts(&self) -> Result<Vec<Timeout>, TimeoutError> {
        let rtxn = self.env.read_txn().map_err(timeout_err)?;
        let mut out = Vec::new();
        for entry in self.timeouts.iter(&rtxn).map_err(timeout_err)? {
            let (_, bytes) = entry.map_err(timeout_err)?;
            out.push(serde_json::from_slice(bytes).map_err(|e| TimeoutError::Codec(e.to_string().into()))?);
        }
        Ok(out)
    }
}

fn storage_err(e: heed::Error) -> StorageError {
    StorageError::Storage(e.to_string().into())
}

fn timeout_err(e: heed::Error) -> TimeoutError {
    TimeoutError::Storage(e.to_string().into())
}

impl StateStorage for LmdbStore {
    fn load(&self, saga_type: &str, instance_id: SagaId) -> Result<Option<SagaInstance>, StorageError> {
        let rtxn = self.env.read_txn().map_err(storage_err)?;
        let key = instance_id.to_string();
        let Some(bytes) = self.instances.get(&rtxn, &key).map_err(storage_err)? else {
            return Ok(None);
        };
        let instance: SagaInstance =
            serde_json::from_slice(bytes).map_err(|e| StorageError::Codec(e.to_string().into()))?;
        Ok((instance.saga_type.as_ref() == saga_type).then_some(instance))
    }

    fn find_by_key(&self, saga_type: &str, key: &CorrelationKey) -> Result<Vec<SagaId>, StorageError> {
        let mut matches: Vec<SagaInstance> = self
            .read_instances()?
            .into_iter()
            .filter(|i| i.saga_type.as_ref() == saga_type && !i.finished && i.has_key(key))
            .collect();
        matches.sort_by_key(|i| (i.created_at_millis, i.id));
        Ok(matches.into_iter().map(|i| i.id).collect())
    }

    fn save(&self, instance: &SagaInstance) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(instance).map_err(|e| StorageError::Codec(e.to_string().into()))?;
        let mut wtxn = self.env.write_txn().map_err(storage_err)?;
        self.instances
            .put(&mut wtxn, &instance.id.to_string(), &bytes)
            .map_err(storage_err)?;
        wtxn.commit().map_err(storage_err)
    }

    fn delete(&self, instance_id: SagaId) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn().map_err(storage_err)?;
        self.instances
            .delete(&mut wtxn, &instance_id.to_string())
            .map_err(storage_err)?;
        wtxn.commit().map_err(storage_err)
    }
}

impl TimeoutStore for LmdbStore {
    fn insert(&self, timeout: &Timeout) -> Result<(), TimeoutError> {
        let bytes = serde_json::to_vec(timeout).map_err(|e| TimeoutError::Codec(e.to_string().into()))?;
        let mut wtxn = self.env.write_txn().map_err(timeout_err)?;
        self.timeouts
            .put(&mut wtxn, &timeout.id.to_string(), &bytes)
            .map_err(timeout_err)?;
        wtxn.commit().map_err(timeout_err)
    }

    fn remove(&self, id: TimeoutId) -> Result<bool, TimeoutError> {
        let mut wtxn = self.env.write_txn().map_err(timeout_err)?;
        let removed = self
            .timeouts
            .delete(&mut wtxn, &id.to_string())
            .map_err(timeout_err)?;
        wtxn.commit().map_err(timeout_err)?;
        Ok(removed)
    }

    fn remove_for_instance(&self, instance_id: SagaId) -> Result<Vec<TimeoutId>, TimeoutError> {
        let owned: Vec<TimeoutId> = self
            .read_timeouts()?
            .into_iter()
            .filter(|t| t.instance_id == instance_id)
            .map(|t| t.id)
            .collect();
        if owned.is_empty() {
            return Ok(owned);
        }

        let mut wtxn = self.env.write_txn().map_err(timeout_err)?;
        for id in &owned {
            self.timeouts
                .delete(&mut wtxn, &id.to_string())
                .map_err(timeout_err)?;
        }
        wtxn.commit().map_err(timeout_err)?;
        Ok(owned)
    }

    fn load_all(&self) -> Result<Vec<Timeout>, TimeoutError> {
        self.read_timeouts()
    }
}

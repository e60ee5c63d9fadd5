//! Optional durable storage for usage records.
//!
//! The ledger is authoritative in memory; an adapter lets usage survive
//! restarts. Saves carry the record version for optimistic concurrency
//! when several engine instances share a store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::ledger::{ScopeKey, UsageRecord};
use crate::{Error, Result};

/// Result of a conditional save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The stored version no longer matches `expected_version`; the
    /// caller should reload and reconcile.
    Conflict { current_version: u64 },
}

/// Durable storage for usage records.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Loads all stored records, keyed by scope.
    async fn load(&self) -> Result<HashMap<ScopeKey, UsageRecord>>;

    /// Stores one record. With `expected_version` set, the write only
    /// lands if the stored version still matches; `None` is an
    /// unconditional upsert for single-writer deployments.
    async fn save(
        &self,
        key: &ScopeKey,
        record: &UsageRecord,
        expected_version: Option<u64>,
    ) -> Result<SaveOutcome>;
}

/// In-memory adapter for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<ScopeKey, UsageRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: HashMap<ScopeKey, UsageRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
    async fn load(&self) -> Result<HashMap<ScopeKey, UsageRecord>> {
        let records = self.records.lock().map_err(|_| Error::PersistenceUnavailable {
            message: "memory store poisoned".into(),
        })?;
        Ok(records.clone())
    }

    async fn save(
        &self,
        key: &ScopeKey,
        record: &UsageRecord,
        expected_version: Option<u64>,
    ) -> Result<SaveOutcome> {
        let mut records = self.records.lock().map_err(|_| Error::PersistenceUnavailable {
            message: "memory store poisoned".into(),
        })?;
        if let Some(expected) = expected_version {
            let current = records.get(key).map(|r| r.version).unwrap_or(0);
            if current != expected {
                return Ok(SaveOutcome::Conflict {
                    current_version: current,
                });
            }
        }
        records.insert(key.clone(), record.clone());
        Ok(SaveOutcome::Saved)
    }
}

//! Chunked batch upsert of derived records.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use ccx_core::CountryRecord;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{CountryStore, StoreError, MAX_CHUNK_ROWS};

pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileResult {
    pub upserted: usize,
    pub chunks: usize,
}

/// A chunk statement failed. Chunks before `chunk_index` stay committed.
#[derive(Debug, Error)]
#[error("reconcile failed at chunk {chunk_index} after {committed} rows were committed: {cause}")]
pub struct ReconcileFailure {
    pub chunk_index: usize,
    pub committed: usize,
    #[source]
    pub cause: StoreError,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn CountryStore>,
    chunk_size: usize,
}

impl Reconciler {
    /// `chunk_size` is clamped to `1..=MAX_CHUNK_ROWS`.
    pub fn new(store: Arc<dyn CountryStore>, chunk_size: usize) -> Self {
        let bounded = chunk_size.clamp(1, MAX_CHUNK_ROWS);
        if bounded != chunk_size {
            warn!(requested = chunk_size, chunk_size = bounded, "chunk size out of range; clamped");
        }
        Self {
            store,
            chunk_size: bounded,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stamp every record with `refreshed_at` and write them in input order,
    /// one statement per chunk. `on_chunk` receives the running committed
    /// count after each successful chunk.
    pub async fn reconcile<F>(
        &self,
        records: Vec<CountryRecord>,
        refreshed_at: DateTime<Utc>,
        mut on_chunk: F,
    ) -> Result<ReconcileResult, ReconcileFailure>
    where
        F: FnMut(usize) + Send,
    {
        let rows = collapse_duplicate_keys(records, refreshed_at);
        let mut committed = 0usize;
        let mut chunks = 0usize;

        for (chunk_index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            self.store
                .upsert_chunk(chunk)
                .await
                .map_err(|cause| ReconcileFailure {
                    chunk_index,
                    committed,
                    cause,
                })?;
            committed += chunk.len();
            chunks += 1;
            debug!(chunk_index, rows = chunk.len(), committed, "chunk committed");
            on_chunk(committed);
        }

        Ok(ReconcileResult {
            upserted: committed,
            chunks,
        })
    }
}

/// Stamp `refreshed_at` and fold rows sharing a natural key into one: the
/// later row's values win, the earlier row's position is kept.
pub fn collapse_duplicate_keys(
    records: Vec<CountryRecord>,
    refreshed_at: DateTime<Utc>,
) -> Vec<CountryRecord> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut rows: Vec<CountryRecord> = Vec::with_capacity(records.len());
    for mut record in records {
        record.last_refreshed_at = refreshed_at;
        match positions.entry(record.key()) {
            Entry::Occupied(slot) => rows[*slot.get()] = record,
            Entry::Vacant(slot) => {
                slot.insert(rows.len());
                rows.push(record);
            }
        }
    }
    rows
}

//! Job-record persistence.
//!
//! Stores periodic crawl snapshots in a redb database keyed by job id. This is
//! progress bookkeeping only; the crawl never depends on a snapshot round-trip
//! for correctness.

use std::path::Path;

use redb::{Database, TableDefinition};
use thiserror::Error;

use crate::crawl::CrawlJob;

const JOBS: TableDefinition<&str, &str> = TableDefinition::new("jobs");

/// Failures surfaced by the snapshot store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// redb-backed job snapshot store.
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        Ok(Self { db })
    }

    /// Persist the current job state, replacing any previous snapshot.
    pub fn save(&self, job: &CrawlJob) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(JOBS)?;
            table.insert(job.id.as_str(), payload.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Load the last snapshot saved for `job_id`, if any.
    pub fn load(&self, job_id: &str) -> Result<Option<CrawlJob>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(JOBS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(value) = table.get(job_id)? else {
            return Ok(None);
        };
        let job = serde_json::from_str(value.value())?;
        Ok(Some(job))
    }
}

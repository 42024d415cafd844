use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use hbt_reconcile::RawBatchRecord;
use hbt_schemas::SourceRole;

use crate::{FetchedRecords, RecordSource, SourceError};

/// In-process source. Backs tests and embeds where a portal writes straight
/// into the process. Can be switched unavailable to exercise skip-a-cycle
/// behavior.
pub struct InMemorySource {
    role: SourceRole,
    records: RwLock<Vec<RawBatchRecord>>,
    available: AtomicBool,
}

impl InMemorySource {
    pub fn new(role: SourceRole) -> Self {
        Self::with_records(role, Vec::new())
    }

    pub fn with_records(role: SourceRole, records: Vec<RawBatchRecord>) -> Self {
        Self {
            role,
            records: RwLock::new(records),
            available: AtomicBool::new(true),
        }
    }

    pub async fn push(&self, record: RawBatchRecord) {
        self.records.write().await.push(record);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RecordSource for InMemorySource {
    fn role(&self) -> SourceRole {
        self.role
    }

    fn name(&self) -> String {
        format!("memory:{}", self.role)
    }

    async fn fetch_records(&self) -> Result<FetchedRecords, SourceError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable(self.name()));
        }
        Ok(FetchedRecords::from(self.records.read().await.clone()))
    }
}

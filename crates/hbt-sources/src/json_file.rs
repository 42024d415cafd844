use std::path::PathBuf;

use hbt_schemas::SourceRole;

use crate::{decode_records, FetchedRecords, RecordSource, SourceError};

/// A participant's collection persisted as one JSON document on disk.
///
/// The file is re-read on every fetch. A missing file means the participant
/// has not written yet and reads as unavailable, not as an empty collection.
pub struct JsonFileSource {
    role: SourceRole,
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(role: SourceRole, path: impl Into<PathBuf>) -> Self {
        Self {
            role,
            path: path.into(),
        }
    }
}

#[async_trait::async_trait]
impl RecordSource for JsonFileSource {
    fn role(&self) -> SourceRole {
        self.role
    }

    fn name(&self) -> String {
        format!("json_file:{}", self.path.display())
    }

    async fn fetch_records(&self) -> Result<FetchedRecords, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", self.path.display())))?;
        if raw.trim().is_empty() {
            return Ok(FetchedRecords::default());
        }
        let body: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| SourceError::Decode(e.to_string()))?;
        let fetched = decode_records(body)?;
        tracing::debug!(
            path = %self.path.display(),
            role = %self.role,
            records = fetched.records.len(),
            malformed = fetched.malformed.len(),
            "fetched"
        );
        Ok(fetched)
    }
}

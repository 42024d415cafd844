use hbt_config::SourceToken;
use hbt_schemas::SourceRole;

use crate::{decode_records, FetchedRecords, RecordSource, SourceError};

/// Participant portal exposing its records over HTTP (`GET <url>` returning
/// JSON). The bearer token, if any, is never logged.
#[derive(Debug, Clone)]
pub struct HttpSource {
    role: SourceRole,
    url: String,
    token: Option<SourceToken>,
    http: reqwest::Client,
}

impl HttpSource {
    pub fn new(role: SourceRole, url: String, token: Option<SourceToken>) -> Self {
        Self {
            role,
            url,
            token,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl RecordSource for HttpSource {
    fn role(&self) -> SourceRole {
        self.role
    }

    fn name(&self) -> String {
        format!("http:{}", self.url)
    }

    async fn fetch_records(&self) -> Result<FetchedRecords, SourceError> {
        let mut req = self.http.get(&self.url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                SourceError::Unavailable(format!("{}: {e}", self.url))
            } else {
                SourceError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let fetched = decode_records(body)?;
        tracing::debug!(
            url = %self.url,
            role = %self.role,
            records = fetched.records.len(),
            malformed = fetched.malformed.len(),
            "fetched"
        );
        Ok(fetched)
    }
}

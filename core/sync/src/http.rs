//! REST backend client.
//!
//! Talks to a PostgREST-style table API: one endpoint per entity table,
//! row filters as `column=op.value` query parameters, bearer api key.

use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use async_trait::async_trait;
use jobsync_common::{EntityType, Error, Record, Result};
use tracing::debug;

use crate::remote::{RemoteError, RemoteResult, RemoteService};

/// Connection settings for [`HttpRemote`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Root of the table API, e.g. `https://api.example.com/rest/v1/`.
    pub base_url: String,
    pub api_key: String,
}

/// Map a non-success status to a remote error.
fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Auth(format!("{} - {}", status, body))
        }
        StatusCode::CONFLICT => RemoteError::Conflict {
            server: Record::new(),
        },
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Network(format!("{} - {}", status, body)),
        s if s.is_server_error() => RemoteError::Network(format!("{} - {}", status, body)),
        _ => RemoteError::Rejected(format!("{} - {}", status, body)),
    }
}

/// HTTP implementation of [`RemoteService`].
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl HttpRemote {
    /// # Errors
    /// - `InvalidInput` if the base URL does not parse
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let mut raw = config.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)
            .map_err(|e| Error::InvalidInput(format!("Invalid remote URL '{}': {}", raw, e)))?;

        Ok(Self {
            http: Client::new(),
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    fn table_url(&self, entity: EntityType) -> RemoteResult<Url> {
        self.base_url
            .join(entity.table_name())
            .map_err(|e| RemoteError::Rejected(format!("Invalid table URL: {}", e)))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header("apikey", &self.api_key)
            .header("Prefer", "return=representation")
    }

    /// Handle API response with error checking.
    async fn handle_response(&self, response: Response) -> RemoteResult<Vec<Record>> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| RemoteError::Rejected(format!("Failed to parse response: {}", e)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> RemoteResult<Vec<Record>> {
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("Request failed: {}", e)))?;
        self.handle_response(response).await
    }

    /// Current server copy of one record.
    async fn fetch_one(&self, entity: EntityType, id: &str) -> RemoteResult<Option<Record>> {
        let filter = format!("eq.{}", id);
        let builder = self
            .request(reqwest::Method::GET, self.table_url(entity)?)
            .query(&[("id", filter.as_str())]);
        Ok(self.send(builder).await?.into_iter().next())
    }

    /// Replace an empty conflict payload with the server's current copy.
    async fn with_server_copy(
        &self,
        entity: EntityType,
        id: &str,
        result: RemoteResult<Vec<Record>>,
    ) -> RemoteResult<Vec<Record>> {
        match result {
            Err(RemoteError::Conflict { .. }) => {
                debug!("Conflict on {} {}, fetching server copy", entity, id);
                let server = self.fetch_one(entity, id).await?.unwrap_or_default();
                Err(RemoteError::Conflict { server })
            }
            other => other,
        }
    }
}

fn first_row(rows: Vec<Record>, entity: EntityType, id: &str) -> RemoteResult<Record> {
    rows.into_iter()
        .next()
        .ok_or_else(|| RemoteError::Rejected(format!("{} {} not found", entity, id)))
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn insert(&self, entity: EntityType, record: &Record) -> RemoteResult<Record> {
        let id = jobsync_common::record_id(record)
            .ok_or_else(|| RemoteError::Rejected("Record has no id".to_string()))?
            .to_string();
        let builder = self
            .request(reqwest::Method::POST, self.table_url(entity)?)
            .json(record);

        let result = self.send(builder).await;
        first_row(self.with_server_copy(entity, &id, result).await?, entity, &id)
    }

    async fn update(&self, entity: EntityType, id: &str, patch: &Record) -> RemoteResult<Record> {
        let filter = format!("eq.{}", id);
        let builder = self
            .request(reqwest::Method::PATCH, self.table_url(entity)?)
            .query(&[("id", filter.as_str())])
            .json(patch);

        let result = self.send(builder).await;
        first_row(self.with_server_copy(entity, id, result).await?, entity, id)
    }

    async fn list(
        &self,
        entity: EntityType,
        owner_id: &str,
        exclude_deleted: bool,
    ) -> RemoteResult<Vec<Record>> {
        let owner = format!("eq.{}", owner_id);
        let mut builder = self
            .request(reqwest::Method::GET, self.table_url(entity)?)
            .query(&[("owner_id", owner.as_str()), ("select", "*")]);
        if exclude_deleted {
            builder = builder.query(&[("deleted_at", "is.null")]);
        }
        self.send(builder).await
    }
}

//! Remote search API contract and the DDB search adapter.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use idwatch_core::{EntityDescriptor, EntityRecord, EntityType};
use idwatch_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::form_urlencoded::byte_serialize;
use uuid::Uuid;

pub const CRATE_NAME: &str = "idwatch-adapters";

/// Cursor that starts every paginated listing.
pub const INITIAL_CURSOR: &str = "*";

const JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    /// Total hits reported by the API for the whole listing, not this page.
    pub total: u64,
    pub next_cursor: Option<String>,
    pub records: Vec<EntityRecord>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed search response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed {entity} document in response from {url}: {source}")]
    Record {
        entity: EntityType,
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait SearchApi: Send + Sync {
    /// One page of the descriptor's listing, starting at `cursor`.
    async fn fetch_page(
        &self,
        run_id: Uuid,
        descriptor: &EntityDescriptor,
        cursor: &str,
    ) -> Result<SearchPage, ApiError>;

    /// Whether `id` is currently present in the live index.
    async fn record_exists(&self, run_id: Uuid, entity: EntityType, id: &str) -> Result<bool, ApiError>;
}

/// Next cursor to request, or `None` once the listing is exhausted.
///
/// The API signals the end by repeating the previous cursor or by sending
/// none at all.
pub fn advance_cursor(previous: &str, next: Option<&str>) -> Option<String> {
    match next.map(str::trim) {
        Some(next) if !next.is_empty() && next != previous => Some(next.to_string()),
        _ => None,
    }
}

/// A CSV answer with more than a header line means the id was found.
pub fn body_has_records(body: &[u8]) -> bool {
    String::from_utf8_lossy(body)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .nth(1)
        .is_some()
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    response: SearchResponse,
    #[serde(default, rename = "nextCursorMark")]
    next_cursor_mark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "numFound")]
    num_found: u64,
    #[serde(default)]
    docs: Vec<JsonValue>,
}

pub fn decode_search_page(entity: EntityType, url: &str, body: &[u8]) -> Result<SearchPage, ApiError> {
    let envelope: SearchEnvelope = serde_json::from_slice(body).map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })?;

    let records = envelope
        .response
        .docs
        .into_iter()
        .map(|doc| EntityRecord::from_json(entity, doc))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ApiError::Record {
            entity,
            url: url.to_string(),
            source,
        })?;

    Ok(SearchPage {
        total: envelope.response.num_found,
        next_cursor: envelope.next_cursor_mark,
        records,
    })
}

/// Adapter for the Deutsche Digitale Bibliothek search API.
#[derive(Debug, Clone)]
pub struct DdbSearchApi {
    http: Arc<HttpFetcher>,
    base_url: String,
    source_id: String,
}

impl DdbSearchApi {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str) -> anyhow::Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&base_url)
            .with_context(|| format!("invalid api base url {base_url:?}"))?;
        let source_id = parsed.host_str().unwrap_or("api").to_string();
        Ok(Self {
            http,
            base_url,
            source_id,
        })
    }

    pub fn page_url(&self, query: &str, cursor: &str) -> String {
        format!("{}{}&cursorMark={}", self.base_url, query, encode(cursor))
    }

    pub fn verify_url(&self, entity: EntityType, id: &str) -> String {
        format!(
            "{}/search/index/{}/select?wt=csv&fl=id&q=id:{}",
            self.base_url,
            entity.index_segment(),
            encode(id)
        )
    }
}

#[async_trait]
impl SearchApi for DdbSearchApi {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        descriptor: &EntityDescriptor,
        cursor: &str,
    ) -> Result<SearchPage, ApiError> {
        let url = self.page_url(&descriptor.query, cursor);
        let response = self
            .http
            .fetch_bytes(run_id, &self.source_id, &url, Some(JSON))
            .await?;
        let page = decode_search_page(descriptor.entity, &response.url, &response.body)?;
        debug!(
            entity = %descriptor.entity,
            cursor,
            records = page.records.len(),
            total = page.total,
            "fetched search page"
        );
        Ok(page)
    }

    async fn record_exists(&self, run_id: Uuid, entity: EntityType, id: &str) -> Result<bool, ApiError> {
        let url = self.verify_url(entity, id);
        let response = self.http.fetch_bytes(run_id, &self.source_id, &url, None).await?;
        Ok(body_has_records(&response.body))
    }
}

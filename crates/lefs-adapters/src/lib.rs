//! Registry adapter contract + the Fedresurs encumbrance adapter.

pub mod extract;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use lefs_core::{
    is_origination, translate_contract_type, ContractDraft, DetailContent, DetailResponse,
    ListingPage, ListingRecord, QueryWindow,
};
use lefs_storage::{FetchError, HttpFetcher};
use reqwest::header::{HeaderName, ACCEPT, REFERER};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use extract::{extract_fields, parse_publish_date, trim_org_prefix, ExtractedFields};

pub const CRATE_NAME: &str = "lefs-adapters";

pub const FEDRESURS_SOURCE_ID: &str = "fedresurs";
pub const DEFAULT_BASE_URL: &str = "https://fedresurs.ru";
pub const DEFAULT_SEARCH_STRING: &str = "договор";
pub const DEFAULT_LISTING_LIMIT: u32 = 10_000;
pub const LISTING_GROUP: &str = "Leasing";

const ACCEPT_JSON: &str = "application/json, text/plain, */*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
    #[error("decoding {what} from {url}")]
    Decode {
        what: &'static str,
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Detail endpoint payload: typed content plus the `content` object as received.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRecord {
    pub content: DetailContent,
    pub raw_content: JsonValue,
}

#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        window: &QueryWindow,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_listing(&self, page: &FetchedPage) -> Result<ListingPage, AdapterError> {
        parse_listing_body(page)
    }

    /// `Ok(None)` means the registry has no detail for this filing yet.
    async fn fetch_detail(
        &self,
        ctx: &AdapterContext,
        guid: &str,
    ) -> Result<Option<FetchedPage>, AdapterError>;

    fn parse_detail(&self, page: &FetchedPage) -> Result<DetailRecord, AdapterError> {
        parse_detail_body(page)
    }
}

#[derive(Debug, Deserialize)]
struct RawListingPage {
    #[serde(rename = "pageData", default)]
    page_data: Option<Vec<JsonValue>>,
    #[serde(default)]
    found: Option<i64>,
}

fn non_empty_body(page: &FetchedPage) -> Result<&[u8], AdapterError> {
    if page.body.iter().all(u8::is_ascii_whitespace) {
        return Err(AdapterError::EmptyBody {
            url: page.url.clone(),
        });
    }
    Ok(&page.body)
}

/// Decode a `{pageData: [...], found: N}` listing body, keeping each raw item.
pub fn parse_listing_body(page: &FetchedPage) -> Result<ListingPage, AdapterError> {
    let body = non_empty_body(page)?;
    let raw: RawListingPage = serde_json::from_slice(body).map_err(|source| AdapterError::Decode {
        what: "listing page",
        url: page.url.clone(),
        source,
    })?;

    let items = raw.page_data.unwrap_or_default();
    let mut records = Vec::with_capacity(items.len());
    let mut rejected = 0usize;
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<ListingRecord>(item.clone()) {
            Ok(mut record) => {
                record.raw = item;
                records.push(record);
            }
            Err(err) => {
                warn!(url = %page.url, index, error = %err, "skipping undecodable listing record");
                rejected += 1;
            }
        }
    }

    Ok(ListingPage {
        found: raw.found.unwrap_or((records.len() + rejected) as i64),
        records,
        rejected,
    })
}

pub fn parse_detail_body(page: &FetchedPage) -> Result<DetailRecord, AdapterError> {
    let body = non_empty_body(page)?;
    let value: JsonValue = serde_json::from_slice(body).map_err(|source| AdapterError::Decode {
        what: "detail",
        url: page.url.clone(),
        source,
    })?;
    let response: DetailResponse =
        serde_json::from_value(value.clone()).map_err(|source| AdapterError::Decode {
            what: "detail content",
            url: page.url.clone(),
            source,
        })?;
    let raw_content = match value.get("content") {
        Some(content) if !content.is_null() => content.clone(),
        _ => serde_json::json!({}),
    };
    Ok(DetailRecord {
        content: response.content,
        raw_content,
    })
}

/// Turn one listing record into an insertable draft.
///
/// Returns `None` for "contract execution" filings, which are never stored, and for records
/// without a GUID.
pub fn record_to_draft(record: &ListingRecord) -> Option<ContractDraft> {
    if record.guid.trim().is_empty() {
        warn!(number = %record.number, "listing record without guid");
        return None;
    }
    let kind = translate_contract_type(&record.kind);
    if is_origination(&kind) {
        return None;
    }

    let date = parse_publish_date(&record.publish_date);
    if date.is_none() {
        warn!(guid = %record.guid, publish_date = %record.publish_date, "unparseable publish date");
    }

    let fields = extract_fields(&record.main_info);
    let list_item_raw = if record.raw.is_null() {
        serde_json::to_value(record).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        record.raw.clone()
    };

    Some(ContractDraft {
        guid: record.guid.clone(),
        kind,
        date,
        number: record.number.clone(),
        contract: fields.contract,
        lessor: fields.lessor,
        lessee: fields.lessee,
        ogrn: fields.ogrn,
        inn: fields.inn,
        list_item_raw,
    })
}

/// Endpoint settings for the Fedresurs backend.
#[derive(Debug, Clone)]
pub struct RegistryEndpoints {
    pub base_url: String,
    pub search_string: String,
    pub listing_limit: u32,
}

impl Default for RegistryEndpoints {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            search_string: DEFAULT_SEARCH_STRING.to_string(),
            listing_limit: DEFAULT_LISTING_LIMIT,
        }
    }
}

impl RegistryEndpoints {
    fn url_with_path(&self, segments: &[&str]) -> Result<Url, AdapterError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| AdapterError::Message(format!("invalid base url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::Message(format!("base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn with_listing_query(&self, mut url: Url, window: &QueryWindow) -> Url {
        url.query_pairs_mut()
            .append_pair("offset", "0")
            .append_pair("limit", &self.listing_limit.to_string())
            .append_pair("searchString", &self.search_string)
            .append_pair("group", LISTING_GROUP)
            .append_pair("publishDateStart", &window.start_param())
            .append_pair("publishDateEnd", &window.end_param());
        url
    }

    /// `GET /backend/encumbrances` for one day, first page only.
    pub fn listing_url(&self, window: &QueryWindow) -> Result<Url, AdapterError> {
        let url = self.url_with_path(&["backend", "encumbrances"])?;
        Ok(self.with_listing_query(url, window))
    }

    /// Public search page the listing request claims to come from.
    pub fn listing_referer(&self, window: &QueryWindow) -> Result<Url, AdapterError> {
        let url = self.url_with_path(&["search", "encumbrances"])?;
        Ok(self.with_listing_query(url, window))
    }

    pub fn detail_url(&self, guid: &str) -> Result<Url, AdapterError> {
        self.url_with_path(&["backend", "sfactmessages", guid])
    }

    pub fn detail_referer(&self, guid: &str) -> Result<Url, AdapterError> {
        self.url_with_path(&["sfactmessage", guid])
    }
}

pub struct FedresursAdapter {
    http: Arc<HttpFetcher>,
    endpoints: RegistryEndpoints,
}

impl FedresursAdapter {
    pub fn new(http: Arc<HttpFetcher>, endpoints: RegistryEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn endpoints(&self) -> &RegistryEndpoints {
        &self.endpoints
    }
}

#[async_trait]
impl RegistryAdapter for FedresursAdapter {
    fn source_id(&self) -> &'static str {
        FEDRESURS_SOURCE_ID
    }

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        window: &QueryWindow,
    ) -> Result<FetchedPage, AdapterError> {
        let url = self.endpoints.listing_url(window)?;
        let referer = self.endpoints.listing_referer(window)?;
        let headers: [(HeaderName, String); 2] = [
            (ACCEPT, ACCEPT_JSON.to_string()),
            (REFERER, referer.to_string()),
        ];
        let resp = self
            .http
            .fetch_bytes(ctx.run_id, self.source_id(), url.as_str(), &headers)
            .await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
            })
    }

    async fn fetch_detail(
        &self,
        ctx: &AdapterContext,
        guid: &str,
    ) -> Result<Option<FetchedPage>, AdapterError> {
        let url = self.endpoints.detail_url(guid)?;
        let referer = self.endpoints.detail_referer(guid)?;
        let headers: [(HeaderName, String); 2] = [
            (ACCEPT, ACCEPT_JSON.to_string()),
            (REFERER, referer.to_string()),
        ];
        match self
            .http
            .fetch_bytes(ctx.run_id, self.source_id(), url.as_str(), &headers)
            .await
        {
            Ok(resp) if resp.status == StatusCode::OK => Ok(Some(FetchedPage {
                url: resp.final_url,
                body: resp.body,
            })),
            Ok(resp) => {
                info!(guid, status = resp.status.as_u16(), "detail not ready");
                Ok(None)
            }
            Err(FetchError::HttpStatus { status, .. }) => {
                info!(guid, status, "detail not ready");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Adapter that serves canned pages instead of calling the registry.
///
/// Listing pages are keyed by window day, detail pages by GUID. Days without a page get an
/// empty listing; GUIDs without a page are "not ready".
#[derive(Debug, Default)]
pub struct FixtureRegistryAdapter {
    listings: HashMap<NaiveDate, FetchedPage>,
    details: HashMap<String, FetchedPage>,
    listing_calls: AtomicUsize,
    detail_calls: AtomicUsize,
}

impl FixtureRegistryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing(mut self, day: NaiveDate, page: FetchedPage) -> Self {
        self.listings.insert(day, page);
        self
    }

    pub fn with_detail(mut self, guid: impl Into<String>, page: FetchedPage) -> Self {
        self.details.insert(guid.into(), page);
        self
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryAdapter for FixtureRegistryAdapter {
    fn source_id(&self) -> &'static str {
        FEDRESURS_SOURCE_ID
    }

    async fn fetch_listing(
        &self,
        _ctx: &AdapterContext,
        window: &QueryWindow,
    ) -> Result<FetchedPage, AdapterError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .listings
            .get(&window.day)
            .cloned()
            .unwrap_or_else(|| inline_page(format!("fixture://listing/{}", window.day), r#"{"pageData":[],"found":0}"#)))
    }

    async fn fetch_detail(
        &self,
        _ctx: &AdapterContext,
        guid: &str,
    ) -> Result<Option<FetchedPage>, AdapterError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.details.get(guid).cloned())
    }
}

pub fn inline_page(url: impl Into<String>, body: impl Into<Vec<u8>>) -> FetchedPage {
    FetchedPage {
        url: url.into(),
        body: body.into(),
    }
}

/// Read a captured response body from disk.
pub fn load_fixture_page(path: impl AsRef<Path>) -> Result<FetchedPage> {
    let path = path.as_ref();
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(inline_page(format!("file://{}", path.display()), body))
}

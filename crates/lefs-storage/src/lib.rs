//! Contract persistence + rate-limited HTTP fetch utilities for LEFS.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use lefs_core::{ContractDraft, ContractRow, EnrichmentPatch, SyncRunRecord};
use reqwest::header::HeaderName;
use reqwest::StatusCode;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lefs-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig::one_every(Duration::from_secs(3))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// A bucket that lets one request through per `interval`.
    pub fn one_every(interval: Duration) -> Self {
        Self {
            capacity: 1,
            refill_every: interval,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and consume it.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && !self.refill_every.is_zero() {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if self.refill_every.is_zero() || state.tokens > 0 {
                state.tokens = state.tokens.saturating_sub(1);
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// Sequential HTTP client: one request in flight, paced by an optional token bucket.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c)));

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(1)),
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// GET `url` with extra headers. Non-success statuses come back as [`FetchError::HttpStatus`].
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(HeaderName, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url, headers).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        headers: &[(HeaderName, String)],
    ) -> Result<FetchedResponse, FetchError> {
        // The semaphore is owned by the fetcher and never closed.
        let _permit = self.in_flight.acquire().await.ok();
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(name.clone(), value.as_str());
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    debug!(status = status.as_u16(), attempt, "response received");

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::HttpStatus {
                status: 0,
                url: url.to_string(),
            }),
        }
    }
}

/// Persistence seam between the sync/enrichment jobs and the `contract` table.
#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Newest completed sync window.
    ///
    /// Without any recorded window the day before the newest stored filing is used, so a
    /// partially stored day is fetched again.
    async fn last_synced_day(&self) -> anyhow::Result<Option<NaiveDate>>;

    /// Insert unless a row with the same GUID exists. Returns whether a row was written.
    async fn insert_contract(&self, draft: &ContractDraft) -> anyhow::Result<bool>;

    async fn record_sync_run(&self, run: &SyncRunRecord) -> anyhow::Result<()>;

    /// Unenriched rows, oldest first.
    async fn unenriched(&self, limit: Option<i64>) -> anyhow::Result<Vec<ContractRow>>;

    /// Write the patch and flip `enriched` to true. Already-enriched rows are left alone.
    async fn apply_enrichment(&self, guid: &str, patch: &EnrichmentPatch) -> anyhow::Result<bool>;

    async fn find_by_guid(&self, guid: &str) -> anyhow::Result<Option<ContractRow>>;
}

#[derive(Debug, Clone)]
pub struct PgContractStore {
    pool: PgPool,
}

const CONTRACT_COLUMNS: &str = "id, guid, type, date, number, contract, lessor, lessee, ogrn, inn, \
     stop_reason, user_comment, list_item_raw, item_raw, enriched, created_at, updated_at";

impl PgContractStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("running database migrations")
    }
}

fn contract_from_row(row: &PgRow) -> anyhow::Result<ContractRow> {
    Ok(ContractRow {
        id: row.try_get("id")?,
        guid: row.try_get("guid")?,
        kind: row.try_get("type")?,
        date: row.try_get("date")?,
        number: row.try_get("number")?,
        contract: row.try_get("contract")?,
        lessor: row.try_get("lessor")?,
        lessee: row.try_get("lessee")?,
        ogrn: row.try_get("ogrn")?,
        inn: row.try_get("inn")?,
        stop_reason: row.try_get("stop_reason")?,
        user_comment: row.try_get("user_comment")?,
        list_item_raw: row.try_get("list_item_raw")?,
        item_raw: row.try_get("item_raw")?,
        enriched: row.try_get("enriched")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ContractStore for PgContractStore {
    async fn last_synced_day(&self) -> anyhow::Result<Option<NaiveDate>> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(
                       (SELECT MAX(window_day) FROM sync_runs),
                       (SELECT MAX(date)::date - 1 FROM contract)
                   ) AS last_day
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("querying last synced day")?;
        Ok(row.try_get::<Option<NaiveDate>, _>("last_day")?)
    }

    async fn insert_contract(&self, draft: &ContractDraft) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO contract
                (guid, type, date, number, contract, lessor, lessee, ogrn, inn,
                 stop_reason, user_comment, list_item_raw, item_raw)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, '', '', $10, '{}'::jsonb)
            ON CONFLICT (guid) DO NOTHING
            "#,
        )
        .bind(&draft.guid)
        .bind(&draft.kind)
        .bind(draft.date)
        .bind(&draft.number)
        .bind(&draft.contract)
        .bind(&draft.lessor)
        .bind(&draft.lessee)
        .bind(&draft.ogrn)
        .bind(&draft.inn)
        .bind(&draft.list_item_raw)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting contract {}", draft.guid))?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_sync_run(&self, run: &SyncRunRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (run_id, window_day, started_at, finished_at, found, received, inserted, skipped, duplicates)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.run_id)
        .bind(run.window_day)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.found)
        .bind(run.received)
        .bind(run.inserted)
        .bind(run.skipped)
        .bind(run.duplicates)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording sync run {}", run.run_id))?;
        Ok(())
    }

    async fn unenriched(&self, limit: Option<i64>) -> anyhow::Result<Vec<ContractRow>> {
        let sql = format!(
            "SELECT {CONTRACT_COLUMNS} FROM contract WHERE enriched = false ORDER BY id LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("querying unenriched contracts")?;
        rows.iter().map(contract_from_row).collect()
    }

    async fn apply_enrichment(&self, guid: &str, patch: &EnrichmentPatch) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE contract
               SET user_comment = $1,
                   stop_reason = $2,
                   number = $3,
                   lessor = $4,
                   lessee = $5,
                   ogrn = $6,
                   inn = $7,
                   item_raw = $8,
                   enriched = true,
                   updated_at = NOW()
             WHERE guid = $9
               AND enriched = false
            "#,
        )
        .bind(&patch.user_comment)
        .bind(&patch.stop_reason)
        .bind(&patch.number)
        .bind(&patch.lessor)
        .bind(&patch.lessee)
        .bind(&patch.ogrn)
        .bind(&patch.inn)
        .bind(&patch.item_raw)
        .bind(guid)
        .execute(&self.pool)
        .await
        .with_context(|| format!("enriching contract {guid}"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_by_guid(&self, guid: &str) -> anyhow::Result<Option<ContractRow>> {
        let sql = format!("SELECT {CONTRACT_COLUMNS} FROM contract WHERE guid = $1");
        let row = sqlx::query(&sql)
            .bind(guid)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading contract {guid}"))?;
        row.as_ref().map(contract_from_row).transpose()
    }
}

/// In-process store with the same semantics as [`PgContractStore`].
#[derive(Debug, Default)]
pub struct MemoryContractStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<ContractRow>,
    runs: Vec<SyncRunRecord>,
}

impl MemoryContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<ContractRow> {
        self.state.lock().await.rows.clone()
    }

    pub async fn runs(&self) -> Vec<SyncRunRecord> {
        self.state.lock().await.runs.clone()
    }
}

#[async_trait]
impl ContractStore for MemoryContractStore {
    async fn last_synced_day(&self) -> anyhow::Result<Option<NaiveDate>> {
        let state = self.state.lock().await;
        if let Some(newest_run) = state.runs.iter().map(|r| r.window_day).max() {
            return Ok(Some(newest_run));
        }
        Ok(state
            .rows
            .iter()
            .filter_map(|r| r.date)
            .map(|d| d.date())
            .max()
            .and_then(|d| d.pred_opt()))
    }

    async fn insert_contract(&self, draft: &ContractDraft) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        if state.rows.iter().any(|r| r.guid == draft.guid) {
            return Ok(false);
        }
        let now = Utc::now();
        let id = state.rows.len() as i64 + 1;
        state.rows.push(ContractRow {
            id,
            guid: draft.guid.clone(),
            kind: draft.kind.clone(),
            date: draft.date,
            number: draft.number.clone(),
            contract: draft.contract.clone(),
            lessor: draft.lessor.clone(),
            lessee: draft.lessee.clone(),
            ogrn: draft.ogrn.clone(),
            inn: draft.inn.clone(),
            stop_reason: String::new(),
            user_comment: String::new(),
            list_item_raw: draft.list_item_raw.clone(),
            item_raw: serde_json::json!({}),
            enriched: false,
            created_at: now,
            updated_at: now,
        });
        Ok(true)
    }

    async fn record_sync_run(&self, run: &SyncRunRecord) -> anyhow::Result<()> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn unenriched(&self, limit: Option<i64>) -> anyhow::Result<Vec<ContractRow>> {
        let state = self.state.lock().await;
        let limit = limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(state
            .rows
            .iter()
            .filter(|r| !r.enriched)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn apply_enrichment(&self, guid: &str, patch: &EnrichmentPatch) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let Some(row) = state.rows.iter_mut().find(|r| r.guid == guid && !r.enriched) else {
            return Ok(false);
        };
        row.user_comment = patch.user_comment.clone();
        row.stop_reason = patch.stop_reason.clone();
        row.number = patch.number.clone();
        row.lessor = patch.lessor.clone();
        row.lessee = patch.lessee.clone();
        row.ogrn = patch.ogrn.clone();
        row.inn = patch.inn.clone();
        row.item_raw = patch.item_raw.clone();
        row.enriched = true;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn find_by_guid(&self, guid: &str) -> anyhow::Result<Option<ContractRow>> {
        let state = self.state.lock().await;
        Ok(state.rows.iter().find(|r| r.guid == guid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn draft(guid: &str, date: Option<&str>) -> ContractDraft {
        ContractDraft {
            guid: guid.to_string(),
            kind: "Изменение договора финансовой аренды (лизинга)".to_string(),
            date: date.map(|d| NaiveDateTime::parse_from_str(d, "%Y-%m-%dT%H:%M:%S").unwrap()),
            number: "12345678".to_string(),
            contract: "№ 1 от 01.06.2023".to_string(),
            lessor: "Лизинг-Трейд".to_string(),
            lessee: "Ромашка".to_string(),
            ogrn: "1027700000000".to_string(),
            inn: "7700000000".to_string(),
            list_item_raw: serde_json::json!({"guid": guid}),
        }
    }

    fn patch(comment: &str) -> EnrichmentPatch {
        EnrichmentPatch {
            user_comment: comment.to_string(),
            stop_reason: String::new(),
            number: "12345678".to_string(),
            lessor: "Лизинг-Трейд".to_string(),
            lessee: "Ромашка".to_string(),
            ogrn: "1027700000000".to_string(),
            inn: "7700000000".to_string(),
            item_raw: serde_json::json!({"text": comment}),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_spaces_requests_by_interval() {
        let bucket = SimpleTokenBucket::new(TokenBucketConfig::one_every(Duration::from_secs(3)));
        let started = Instant::now();
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn memory_store_inserts_each_guid_once() {
        let store = MemoryContractStore::new();
        assert!(store.insert_contract(&draft("a", None)).await.unwrap());
        assert!(!store.insert_contract(&draft("a", None)).await.unwrap());
        assert_eq!(store.rows().await.len(), 1);
    }

    fn run_for(day: NaiveDate) -> SyncRunRecord {
        SyncRunRecord {
            run_id: Uuid::new_v4(),
            window_day: day,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            found: 0,
            received: 0,
            inserted: 0,
            skipped: 0,
            duplicates: 0,
        }
    }

    #[tokio::test]
    async fn last_synced_day_without_runs_refetches_newest_row_day() {
        let store = MemoryContractStore::new();
        assert_eq!(store.last_synced_day().await.unwrap(), None);

        store
            .insert_contract(&draft("a", Some("2023-06-02T10:15:00")))
            .await
            .unwrap();
        assert_eq!(
            store.last_synced_day().await.unwrap(),
            NaiveDate::from_ymd_opt(2023, 6, 1)
        );
    }

    #[tokio::test]
    async fn recorded_runs_alone_drive_the_cursor() {
        let store = MemoryContractStore::new();
        let finished = NaiveDate::from_ymd_opt(2023, 6, 2).unwrap();
        store.record_sync_run(&run_for(finished)).await.unwrap();

        // Rows from an unfinished later window do not move the cursor.
        store
            .insert_contract(&draft("a", Some("2023-06-03T10:15:00")))
            .await
            .unwrap();
        assert_eq!(store.last_synced_day().await.unwrap(), Some(finished));

        let empty_day = NaiveDate::from_ymd_opt(2023, 6, 4).unwrap();
        store.record_sync_run(&run_for(empty_day)).await.unwrap();
        assert_eq!(store.last_synced_day().await.unwrap(), Some(empty_day));
    }

    #[tokio::test]
    async fn enrichment_only_transitions_false_to_true() {
        let store = MemoryContractStore::new();
        store.insert_contract(&draft("a", None)).await.unwrap();

        assert!(store.apply_enrichment("a", &patch("first")).await.unwrap());
        assert!(!store.apply_enrichment("a", &patch("second")).await.unwrap());

        let row = store.find_by_guid("a").await.unwrap().unwrap();
        assert!(row.enriched);
        assert_eq!(row.user_comment, "first");
        assert!(store.unenriched(None).await.unwrap().is_empty());
    }
}

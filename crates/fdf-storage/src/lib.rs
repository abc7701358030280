//! Ledger persistence, raw response archive and HTTP fetch utilities for FDF.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fdf_core::DestinationRecord;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const LEDGER_SCHEMA_VERSION: u32 = 1;

/// Write `bytes` to `path` through a sibling temp file and a rename, so readers
/// never observe a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Persistence seam for the destination ledger.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All persisted records, or an empty list when nothing was saved yet.
    async fn load(&self) -> anyhow::Result<Vec<DestinationRecord>>;

    async fn save(&self, records: &[DestinationRecord]) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    destinations: Vec<DestinationRecord>,
}

/// Ledger kept as a single pretty-printed JSON document.
#[derive(Debug, Clone)]
pub struct JsonLedgerStore {
    path: PathBuf,
}

impl JsonLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for JsonLedgerStore {
    async fn load(&self) -> anyhow::Result<Vec<DestinationRecord>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking ledger path {}", self.path.display()))?
        {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let file: LedgerFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        if file.schema_version != LEDGER_SCHEMA_VERSION {
            anyhow::bail!(
                "unsupported ledger schema_version={} in {} (expected {})",
                file.schema_version,
                self.path.display(),
                LEDGER_SCHEMA_VERSION
            );
        }
        Ok(file.destinations)
    }

    async fn save(&self, records: &[DestinationRecord]) -> anyhow::Result<()> {
        let file = LedgerFile {
            schema_version: LEDGER_SCHEMA_VERSION,
            saved_at: Utc::now(),
            destinations: records.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing ledger")?;
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), records = records.len(), "ledger saved");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw provider responses.
#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

impl ResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        provider_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(provider_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        provider_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredResponse> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path(fetched_at, provider_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(StoredResponse {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Whether a request may reach the provider more than once. Quote lookups are
/// reads; a message delivery must not be repeated once the provider may have
/// acted on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Repeatable,
    AtMostOnce,
}

/// Outcome of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    Status(StatusCode),
    Timeout,
    Connect,
    Request,
    Other,
}

impl AttemptFailure {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect
        } else if err.is_request() {
            Self::Request
        } else {
            Self::Other
        }
    }
}

impl Delivery {
    pub fn for_method(method: &Method) -> Self {
        if method.is_idempotent() {
            Self::Repeatable
        } else {
            Self::AtMostOnce
        }
    }

    /// A 429 or a failed connect means the provider never handled the request,
    /// so those repeat for every delivery. Timeouts and 5xx repeat only reads.
    pub fn allows_retry(self, failure: AttemptFailure) -> bool {
        match failure {
            AttemptFailure::Status(StatusCode::TOO_MANY_REQUESTS) | AttemptFailure::Connect => true,
            AttemptFailure::Status(status) => {
                self == Self::Repeatable && status.is_server_error()
            }
            AttemptFailure::Timeout | AttemptFailure::Request => self == Self::Repeatable,
            AttemptFailure::Other => false,
        }
    }
}

/// `scheme://host/path` without the query string, which may carry credentials.
pub fn redact_query(url: &Url) -> String {
    format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.path()
    )
}

/// Doubling delay between attempts, capped at `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0 is the first retry).
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX).min(16);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub quota: Option<QuotaConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            quota: None,
        }
    }
}

/// Provider query quota: up to `burst` requests at once, one slot back every
/// `slot_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    pub burst: u32,
    pub slot_interval: Duration,
}

impl QuotaConfig {
    pub fn per_minute(per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        Self {
            burst: per_minute,
            slot_interval: Duration::from_secs(60) / per_minute,
        }
    }
}

#[derive(Debug)]
struct QuotaState {
    available: u32,
    refilled_at: Instant,
}

#[derive(Debug)]
pub struct RequestQuota {
    config: QuotaConfig,
    state: Mutex<QuotaState>,
}

impl RequestQuota {
    pub fn new(config: QuotaConfig) -> Self {
        let config = QuotaConfig {
            burst: config.burst.max(1),
            ..config
        };
        Self {
            config,
            state: Mutex::new(QuotaState {
                available: config.burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut QuotaState, now: Instant) {
        let interval = self.config.slot_interval;
        if interval.is_zero() {
            state.available = self.config.burst;
            state.refilled_at = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.refilled_at);
        let slots = u32::try_from(elapsed.as_nanos() / interval.as_nanos()).unwrap_or(u32::MAX);
        if slots == 0 {
            return;
        }
        state.available = state.available.saturating_add(slots).min(self.config.burst);
        // A full quota does not bank future slots.
        state.refilled_at = if state.available == self.config.burst {
            now
        } else {
            state.refilled_at + interval * slots
        };
    }

    /// Wait until a slot is free and claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                (state.refilled_at + self.config.slot_interval).saturating_duration_since(now)
            };
            debug!(wait_ms = wait.as_millis() as u64, "query quota exhausted; waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {detail}")]
    HttpStatus {
        status: u16,
        url: String,
        detail: String,
    },
}

/// Shared reqwest client with retry/backoff and an optional query quota.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    quota: Option<RequestQuota>,
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
        Ok(Self {
            client,
            quota: config.quota.map(RequestQuota::new),
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(
        &self,
        provider_id: &str,
        url: &Url,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(provider_id, url, Delivery::for_method(&Method::GET), || {
            self.client.get(url.clone())
        })
        .await
    }

    /// Form POST that is never repeated once the provider may have handled it.
    pub async fn post_form(
        &self,
        provider_id: &str,
        url: &Url,
        basic_auth: Option<(&str, &str)>,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(provider_id, url, Delivery::for_method(&Method::POST), || {
            let request = self.client.post(url.clone()).form(form);
            match basic_auth {
                Some((user, password)) => request.basic_auth(user, Some(password)),
                None => request,
            }
        })
        .await
    }

    async fn execute<F>(
        &self,
        provider_id: &str,
        url: &Url,
        delivery: Delivery,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        if let Some(quota) = &self.quota {
            quota.acquire().await;
        }

        let redacted = redact_query(url);
        let span = info_span!("http_fetch", provider_id, url = %redacted, ?delivery);
        self.retry_loop(&redacted, delivery, build)
            .instrument(span)
            .await
    }

    async fn retry_loop<F>(
        &self,
        redacted: &str,
        delivery: Delivery,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retries = 0usize;
        loop {
            let retries_left = retries < self.backoff.max_retries;
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { status, body });
                    }

                    if retries_left && delivery.allows_retry(AttemptFailure::Status(status)) {
                        debug!(retries, status = status.as_u16(), "retrying after status");
                        tokio::time::sleep(self.backoff.delay_before_retry(retries)).await;
                        retries += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: redacted.to_string(),
                        detail: body.chars().take(200).collect(),
                    });
                }
                Err(err) => {
                    let failure = AttemptFailure::from_reqwest(&err);
                    if retries_left && delivery.allows_retry(failure) {
                        debug!(retries, ?failure, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_before_retry(retries)).await;
                        retries += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use fdf_core::{BestPrice, FlightLeg, Offer, PriceInsights};
    use tempfile::tempdir;

    fn offer(total_price: f64) -> Offer {
        let leg = |flight_number: &str| FlightLeg {
            airline: "Iberia".into(),
            flight_number: flight_number.into(),
            departure_time: "2026-05-01 09:05".into(),
            arrival_time: "2026-05-02 06:30".into(),
            stopovers: 0,
            duration_minutes: 745,
        };
        Offer {
            total_price,
            origin_city: "ASU".into(),
            origin_airport: "ASU".into(),
            destination_city: "BCN".into(),
            destination_airport: "BCN".into(),
            departure_date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            return_date: NaiveDate::from_ymd_opt(2026, 5, 9).unwrap(),
            trip_duration_days: 8,
            outbound: leg("IB 40"),
            inbound: leg("IB 41"),
            insights: PriceInsights::default(),
        }
    }

    #[tokio::test]
    async fn ledger_round_trip_preserves_every_field() {
        let dir = tempdir().expect("tempdir");
        let store = JsonLedgerStore::new(dir.path().join("ledger.json"));

        let mut priced = DestinationRecord::unpriced("Barcelona", "BCN");
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        priced.record_offer(&offer(1234.56), at);
        let records = vec![
            priced,
            DestinationRecord::unpriced("Prague", "PRG"),
            DestinationRecord::unpriced("Kuala Lumpur", "KUL"),
        ];

        store.save(&records).await.expect("save");
        let loaded = store.load().await.expect("load");

        assert_eq!(loaded, records);
        assert_eq!(loaded[1].best_price(), BestPrice::Unpriced);
        assert_eq!(loaded[0].best_price(), BestPrice::Priced(1234.56));
    }

    #[tokio::test]
    async fn missing_ledger_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonLedgerStore::new(dir.path().join("nested").join("ledger.json"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn ledger_rejects_unknown_schema_version() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{"schema_version": 99, "saved_at": "2026-02-24T12:00:00Z", "destinations": []}"#,
        )
        .unwrap();
        let err = JsonLedgerStore::new(&path).load().await.unwrap_err();
        assert!(err.to_string().contains("schema_version=99"));
    }

    #[tokio::test]
    async fn repeated_saves_overwrite_without_leaving_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = JsonLedgerStore::new(dir.path().join("ledger.json"));
        store
            .save(&[DestinationRecord::unpriced("Rome", "FCO")])
            .await
            .expect("first save");
        store
            .save(&[
                DestinationRecord::unpriced("Rome", "FCO"),
                DestinationRecord::unpriced("Athens", "ATH"),
            ])
            .await
            .expect("second save");

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["ledger.json".to_string()]);
        assert_eq!(store.load().await.unwrap().len(), 2);
    }

    #[test]
    fn response_hashing_is_stable() {
        let hash = ResponseArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = ResponseArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_bytes(fetched_at, "serpapi-google-flights", "json", b"{\"best_flights\":[]}")
            .await
            .expect("first store");
        let second = archive
            .store_bytes(fetched_at, "serpapi-google-flights", "json", b"{\"best_flights\":[]}")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("20260224").join("serpapi-google-flights")));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_doubles_from_initial_delay_up_to_ceiling() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_before_retry(0), Duration::from_millis(500));
        assert_eq!(policy.delay_before_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before_retry(4), Duration::from_secs(8));
        assert_eq!(policy.delay_before_retry(usize::MAX), Duration::from_secs(8));
    }

    #[test]
    fn quote_lookups_retry_throttling_timeouts_and_server_errors() {
        let lookup = Delivery::for_method(&Method::GET);
        assert_eq!(lookup, Delivery::Repeatable);

        assert!(lookup.allows_retry(AttemptFailure::Status(StatusCode::TOO_MANY_REQUESTS)));
        assert!(lookup.allows_retry(AttemptFailure::Status(StatusCode::BAD_GATEWAY)));
        assert!(lookup.allows_retry(AttemptFailure::Timeout));
        assert!(!lookup.allows_retry(AttemptFailure::Status(StatusCode::UNAUTHORIZED)));
        assert!(!lookup.allows_retry(AttemptFailure::Other));
    }

    #[test]
    fn message_posts_never_repeat_after_the_provider_may_have_accepted_them() {
        let delivery = Delivery::for_method(&Method::POST);
        assert_eq!(delivery, Delivery::AtMostOnce);

        assert!(!delivery.allows_retry(AttemptFailure::Timeout));
        assert!(!delivery.allows_retry(AttemptFailure::Request));
        assert!(!delivery.allows_retry(AttemptFailure::Status(StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(!delivery.allows_retry(AttemptFailure::Status(StatusCode::BAD_GATEWAY)));
        assert!(delivery.allows_retry(AttemptFailure::Status(StatusCode::TOO_MANY_REQUESTS)));
        assert!(delivery.allows_retry(AttemptFailure::Connect));
    }

    #[test]
    fn redaction_drops_query_credentials() {
        let url = Url::parse_with_params(
            "https://serpapi.com/search",
            &[("engine", "google_flights"), ("api_key", "secret")],
        )
        .unwrap();
        assert_eq!(redact_query(&url), "https://serpapi.com/search");
    }

    #[test]
    fn serpapi_quota_spreads_slots_over_a_minute() {
        let quota = QuotaConfig::per_minute(30);
        assert_eq!(quota.burst, 30);
        assert_eq!(quota.slot_interval, Duration::from_secs(2));
        assert_eq!(QuotaConfig::per_minute(0).burst, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_allows_a_burst_then_waits_one_slot_per_query() {
        let quota = RequestQuota::new(QuotaConfig::per_minute(30));
        let started = Instant::now();

        for _ in 0..30 {
            quota.acquire().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);

        quota.acquire().await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        quota.acquire().await;
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_quota_refills_to_burst_without_banking_extra_slots() {
        let quota = RequestQuota::new(QuotaConfig {
            burst: 2,
            slot_interval: Duration::from_secs(10),
        });
        quota.acquire().await;
        quota.acquire().await;

        tokio::time::advance(Duration::from_secs(120)).await;
        let resumed = Instant::now();
        quota.acquire().await;
        quota.acquire().await;
        assert_eq!(resumed.elapsed(), Duration::ZERO);

        quota.acquire().await;
        assert_eq!(resumed.elapsed(), Duration::from_secs(10));
    }
}

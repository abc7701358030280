//! Search pipeline: date sampling, budgeted price search, deal evaluation and
//! the per-run orchestration over origins and the destination ledger.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use fdf_adapters::{
    notifier_for, FixtureQuoteProvider, Notifier, QueryError, QuoteProvider, SerpApiQuoteProvider,
    SerpApiSettings, TwilioCredentials,
};
use fdf_core::{
    is_iata_code, seed_records, BestPrice, DayRange, DestinationRecord, FlightLeg, Offer, SearchWindow,
};
use fdf_storage::{
    HttpClientConfig, HttpFetcher, JsonLedgerStore, QuotaConfig, RecordStore, ResponseArchive,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} range is inverted: min={min} > max={max}")]
    InvertedRange {
        name: &'static str,
        min: u32,
        max: u32,
    },
    #[error(
        "max search offset ({max_offset} days) is shorter than max trip duration ({max_duration} days)"
    )]
    OffsetShorterThanTrip { max_offset: u32, max_duration: u32 },
    #[error("max iterations per destination must be at least 1")]
    ZeroIterations,
    #[error("no origin airports configured")]
    NoOrigins,
    #[error("invalid IATA airport code {0:?}")]
    InvalidIata(String),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("no quote provider configured: set SERPAPI_API_KEY or FDF_FIXTURES_DIR")]
    NoProvider,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub ledger_path: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub trip_duration: DayRange,
    pub search_offset: DayRange,
    pub max_iterations: usize,
    pub origins: Vec<String>,
    pub start_delay_days: u32,
    pub rng_seed: Option<u64>,
    pub destinations_file: Option<PathBuf>,
    pub fixtures_dir: Option<PathBuf>,
    pub serpapi_key: Option<ApiKey>,
    pub currency: String,
    pub language: String,
    pub twilio: Option<TwilioCredentials>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_queries_per_minute: Option<u32>,
}

fn parse_var<T: FromStr>(
    var: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw }),
    }
}

fn parse_optional_var<T: FromStr>(
    var: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|raw| {
            raw.parse()
                .map_err(|_| ConfigError::InvalidEnv { var, value: raw })
        })
        .transpose()
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let twilio = match (
            get("TWILIO_ACCOUNT_SID"),
            get("TWILIO_AUTH_TOKEN"),
            get("TWILIO_WHATSAPP_NUMBER"),
            get("YOUR_WHATSAPP_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number), Some(to_number)) => {
                Some(TwilioCredentials {
                    account_sid,
                    auth_token,
                    from_number,
                    to_number,
                })
            }
            _ => None,
        };

        Ok(Self {
            ledger_path: get("FDF_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./flight_ledger.json")),
            reports_dir: get("FDF_REPORTS_DIR").map(PathBuf::from),
            archive_dir: get("FDF_ARCHIVE_DIR").map(PathBuf::from),
            trip_duration: DayRange::new(
                parse_var("FDF_MIN_TRIP_DAYS", get("FDF_MIN_TRIP_DAYS"), 7)?,
                parse_var("FDF_MAX_TRIP_DAYS", get("FDF_MAX_TRIP_DAYS"), 10)?,
            ),
            search_offset: DayRange::new(
                parse_var(
                    "FDF_MIN_SEARCH_OFFSET_DAYS",
                    get("FDF_MIN_SEARCH_OFFSET_DAYS"),
                    150,
                )?,
                parse_var(
                    "FDF_MAX_SEARCH_OFFSET_DAYS",
                    get("FDF_MAX_SEARCH_OFFSET_DAYS"),
                    180,
                )?,
            ),
            max_iterations: parse_var("FDF_MAX_ITERATIONS", get("FDF_MAX_ITERATIONS"), 3)?,
            origins: get("FDF_ORIGINS")
                .unwrap_or_else(|| "ASU".to_string())
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            start_delay_days: parse_var("FDF_START_DELAY_DAYS", get("FDF_START_DELAY_DAYS"), 1)?,
            rng_seed: parse_optional_var("FDF_RNG_SEED", get("FDF_RNG_SEED"))?,
            destinations_file: get("FDF_DESTINATIONS_FILE").map(PathBuf::from),
            fixtures_dir: get("FDF_FIXTURES_DIR").map(PathBuf::from),
            serpapi_key: get("SERPAPI_API_KEY").map(ApiKey::new),
            currency: get("FDF_CURRENCY").unwrap_or_else(|| "USD".to_string()),
            language: get("FDF_LANGUAGE").unwrap_or_else(|| "en".to_string()),
            twilio,
            scheduler_enabled: get("FDF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: get("FDF_SYNC_CRON").unwrap_or_else(|| "0 0 9 * * *".to_string()),
            user_agent: get("FDF_USER_AGENT").unwrap_or_else(|| "fdf-bot/0.1".to_string()),
            http_timeout_secs: parse_var(
                "FDF_HTTP_TIMEOUT_SECS",
                get("FDF_HTTP_TIMEOUT_SECS"),
                20,
            )?,
            max_queries_per_minute: parse_optional_var(
                "FDF_MAX_QUERIES_PER_MINUTE",
                get("FDF_MAX_QUERIES_PER_MINUTE"),
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.search_sampler()?;
        if self.fixtures_dir.is_none() && self.serpapi_key.is_none() {
            return Err(ConfigError::NoProvider);
        }
        Ok(())
    }

    /// Checks the search settings and returns the sampler they describe.
    pub fn search_sampler(&self) -> Result<DateSampler, ConfigError> {
        let sampler = DateSampler::new(self.trip_duration, self.search_offset)?;
        if self.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.origins.is_empty() {
            return Err(ConfigError::NoOrigins);
        }
        if let Some(bad) = self.origins.iter().find(|code| !is_iata_code(code)) {
            return Err(ConfigError::InvalidIata(bad.clone()));
        }
        Ok(sampler)
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            quota: self.max_queries_per_minute.map(QuotaConfig::per_minute),
            ..Default::default()
        }
    }
}

/// Draws trip windows: a duration from the trip range, then a departure offset
/// in `[0, offset.max - duration]` so the return never passes `offset.max`.
#[derive(Debug, Clone, Copy)]
pub struct DateSampler {
    trip_duration: DayRange,
    search_offset: DayRange,
}

impl DateSampler {
    pub fn new(trip_duration: DayRange, search_offset: DayRange) -> Result<Self, ConfigError> {
        if !trip_duration.is_ordered() {
            return Err(ConfigError::InvertedRange {
                name: "trip duration",
                min: trip_duration.min,
                max: trip_duration.max,
            });
        }
        if !search_offset.is_ordered() {
            return Err(ConfigError::InvertedRange {
                name: "search offset",
                min: search_offset.min,
                max: search_offset.max,
            });
        }
        if search_offset.max < trip_duration.max {
            return Err(ConfigError::OffsetShorterThanTrip {
                max_offset: search_offset.max,
                max_duration: trip_duration.max,
            });
        }
        Ok(Self {
            trip_duration,
            search_offset,
        })
    }

    pub fn sample<R: Rng + ?Sized>(&self, search_start: NaiveDate, rng: &mut R) -> SearchWindow {
        let duration = rng.gen_range(self.trip_duration.min..=self.trip_duration.max);
        let offset = rng.gen_range(0..=self.search_offset.max - duration);
        SearchWindow::starting_at(
            search_start + ChronoDuration::days(i64::from(offset)),
            duration,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub best: Option<Offer>,
    pub queries: usize,
    pub failed_queries: usize,
    pub early_stopped: bool,
}

/// Budgeted random search over trip windows for one route.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptimizer {
    sampler: DateSampler,
    max_iterations: usize,
}

impl SearchOptimizer {
    pub fn new(sampler: DateSampler, max_iterations: usize) -> Self {
        Self {
            sampler,
            max_iterations,
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Each round spends one query, failed or not. The first offer at the
    /// minimum price is kept; any offer priced within its own typical range
    /// ends the search.
    pub async fn optimize<R: Rng + Send + ?Sized>(
        &self,
        provider: &dyn QuoteProvider,
        rng: &mut R,
        origin: &str,
        destination: &str,
        search_start: NaiveDate,
    ) -> SearchOutcome {
        let mut outcome = SearchOutcome::default();

        for round in 0..self.max_iterations {
            let window = self.sampler.sample(search_start, rng);
            outcome.queries += 1;
            debug!(
                round,
                departure = %window.departure_date,
                return_date = %window.return_date,
                "querying provider"
            );

            let offer = match provider.query(origin, destination, &window).await {
                Ok(offer) => offer,
                Err(QueryError::NoOffers) => {
                    outcome.failed_queries += 1;
                    info!(departure = %window.departure_date, "no flights found");
                    continue;
                }
                Err(err) => {
                    outcome.failed_queries += 1;
                    warn!(departure = %window.departure_date, error = %err, "quote query failed");
                    continue;
                }
            };

            let within_typical = offer.within_typical_range();
            let improves = outcome
                .best
                .as_ref()
                .map_or(true, |best| offer.total_price < best.total_price);
            if improves {
                outcome.best = Some(offer);
            }

            if within_typical {
                debug!(round, "price within typical range; stopping early");
                outcome.early_stopped = true;
                break;
            }
        }

        outcome
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub updated: bool,
    pub notification: Option<String>,
}

/// Compares fresh offers against the ledger and writes the alert text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DealEvaluator;

fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 {
        format!("{amount:.0}")
    } else {
        format!("{amount:.2}")
    }
}

impl DealEvaluator {
    pub fn evaluate(&self, record: &mut DestinationRecord, offer: &Offer) -> Evaluation {
        self.evaluate_at(record, offer, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        record: &mut DestinationRecord,
        offer: &Offer,
        at: DateTime<Utc>,
    ) -> Evaluation {
        match record.record_offer(offer, at) {
            Some(previous) => Evaluation {
                updated: true,
                notification: Some(self.compose_alert(offer, previous)),
            },
            None => Evaluation {
                updated: false,
                notification: None,
            },
        }
    }

    pub fn compose_alert(&self, offer: &Offer, previous: BestPrice) -> String {
        let leg_lines = |title: &str, leg: &FlightLeg, date: NaiveDate| {
            [
                format!("{title}: {} {}", leg.airline, leg.flight_number),
                format!(
                    "Departure: {date} at {}, Arrival: {}",
                    leg.departure_time, leg.arrival_time
                ),
                format!(
                    "Stopovers: {}, Duration: {}",
                    leg.stopovers,
                    leg.duration_label()
                ),
            ]
        };

        let mut lines = vec![format!(
            "Low price alert! Only ${} for a {}-day round trip from {}-{} to {}-{}.",
            format_amount(offer.total_price),
            offer.trip_duration_days,
            offer.origin_city,
            offer.origin_airport,
            offer.destination_city,
            offer.destination_airport
        )];
        lines.extend(leg_lines("Outbound Flight", &offer.outbound, offer.departure_date));
        lines.extend(leg_lines("Return Flight", &offer.inbound, offer.return_date));
        lines.push("This price is for the entire round trip.".to_string());
        lines.push(match previous {
            BestPrice::Priced(amount) => {
                format!("This is lower than the previous lowest price of ${amount:.2}.")
            }
            BestPrice::Unpriced => "This is the first recorded price for this route.".to_string(),
        });
        if let Some(level) = &offer.insights.price_level {
            lines.push(format!("Price level: {level}"));
        }
        if let Some(range) = offer.insights.typical_price_range {
            lines.push(format!(
                "Typical price range: ${} - ${}",
                format_amount(range.low),
                format_amount(range.high)
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DestinationsFile {
    destinations: Vec<DestinationSeed>,
}

#[derive(Debug, Clone, Deserialize)]
struct DestinationSeed {
    city: String,
    iata_code: String,
}

/// Seed list from a YAML file, or the built-in list when no file is configured.
pub fn load_seed_destinations(path: Option<&Path>) -> Result<Vec<DestinationRecord>> {
    let Some(path) = path else {
        return Ok(seed_records());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: DestinationsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if let Some(bad) = file.destinations.iter().find(|d| !is_iata_code(&d.iata_code)) {
        anyhow::bail!(
            "invalid IATA code {:?} for {} in {}",
            bad.iata_code,
            bad.city,
            path.display()
        );
    }
    Ok(file
        .destinations
        .into_iter()
        .map(|d| DestinationRecord::unpriced(d.city, d.iata_code))
        .collect())
}

/// In-memory table of destinations, in persisted order.
#[derive(Debug, Clone, Default)]
pub struct DestinationLedger {
    records: Vec<DestinationRecord>,
}

impl DestinationLedger {
    pub fn new(records: Vec<DestinationRecord>) -> Self {
        Self { records }
    }

    /// Load the persisted ledger; an empty store is seeded and saved right away.
    /// A failed initial save is logged and the seeded ledger is still used.
    pub async fn load_or_seed(
        store: &dyn RecordStore,
        seeds: Vec<DestinationRecord>,
    ) -> Result<Self> {
        let records = store.load().await.context("loading destination ledger")?;
        if !records.is_empty() {
            info!(destinations = records.len(), "ledger loaded");
            return Ok(Self::new(records));
        }

        info!(destinations = seeds.len(), "ledger empty; seeding destinations");
        let ledger = Self::new(seeds);
        if let Err(err) = store.save(ledger.records()).await {
            error!(error = %format!("{err:#}"), "failed to persist seeded ledger");
        }
        Ok(ledger)
    }

    pub fn records(&self) -> &[DestinationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn priced_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.best_price().is_priced())
            .count()
    }

    pub fn get(&self, iata_code: &str) -> Option<&DestinationRecord> {
        self.records.iter().find(|r| r.iata_code() == iata_code)
    }

    pub fn get_mut(&mut self, iata_code: &str) -> Option<&mut DestinationRecord> {
        self.records.iter_mut().find(|r| r.iata_code() == iata_code)
    }

    fn record_mut(&mut self, index: usize) -> Option<&mut DestinationRecord> {
        self.records.get_mut(index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DealAlert {
    pub origin: String,
    pub destination: String,
    pub city: String,
    pub previous: BestPrice,
    pub price: f64,
    pub departure_date: NaiveDate,
    pub return_date: NaiveDate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStats {
    pub destinations_visited: usize,
    pub queries: usize,
    pub failed_queries: usize,
    pub offers_found: usize,
    pub improvements: usize,
    pub early_stops: usize,
    pub notifications_sent: usize,
    pub notification_failures: usize,
    pub persistence_failures: usize,
    pub deals: Vec<DealAlert>,
}

/// One full pass over every origin and ledger destination.
pub struct Runner {
    optimizer: SearchOptimizer,
    evaluator: DealEvaluator,
    origins: Vec<String>,
    provider: Box<dyn QuoteProvider>,
    store: Arc<dyn RecordStore>,
    notifier: Box<dyn Notifier>,
    rng: StdRng,
}

impl Runner {
    pub fn new(
        optimizer: SearchOptimizer,
        origins: Vec<String>,
        provider: Box<dyn QuoteProvider>,
        store: Arc<dyn RecordStore>,
        notifier: Box<dyn Notifier>,
        rng: StdRng,
    ) -> Self {
        Self {
            optimizer,
            evaluator: DealEvaluator,
            origins,
            provider,
            store,
            notifier,
            rng,
        }
    }

    /// Never fails: provider, persistence and notification problems are logged
    /// and counted, and the pass moves on to the next destination.
    pub async fn run(&mut self, ledger: &mut DestinationLedger, search_start: NaiveDate) -> RunStats {
        let mut stats = RunStats::default();

        for origin in &self.origins {
            for index in 0..ledger.len() {
                let (city, destination) = match ledger.records().get(index) {
                    Some(record) => (record.city().to_string(), record.iata_code().to_string()),
                    None => continue,
                };
                let span = info_span!("destination", %origin, %destination);
                stats.destinations_visited += 1;

                let outcome = self
                    .optimizer
                    .optimize(
                        self.provider.as_ref(),
                        &mut self.rng,
                        origin,
                        &destination,
                        search_start,
                    )
                    .instrument(span.clone())
                    .await;
                stats.queries += outcome.queries;
                stats.failed_queries += outcome.failed_queries;
                if outcome.early_stopped {
                    stats.early_stops += 1;
                }

                let Some(offer) = outcome.best else {
                    continue;
                };
                stats.offers_found += 1;

                let Some(record) = ledger.record_mut(index) else {
                    continue;
                };
                let previous = record.best_price();
                let evaluation = self.evaluator.evaluate(record, &offer);
                if !evaluation.updated {
                    span.in_scope(|| {
                        info!(
                            price = offer.total_price,
                            best = ?previous.amount(),
                            "offer does not beat recorded best"
                        )
                    });
                    continue;
                }

                stats.improvements += 1;
                stats.deals.push(DealAlert {
                    origin: origin.clone(),
                    destination: destination.clone(),
                    city,
                    previous,
                    price: offer.total_price,
                    departure_date: offer.departure_date,
                    return_date: offer.return_date,
                });

                if let Err(err) = self.store.save(ledger.records()).await {
                    stats.persistence_failures += 1;
                    span.in_scope(|| {
                        error!(error = %format!("{err:#}"), "failed to persist ledger; keeping in-memory update")
                    });
                }

                if let Some(text) = evaluation.notification {
                    span.in_scope(|| info!("{text}"));
                    match self.notifier.send(&text).instrument(span.clone()).await {
                        Ok(()) => stats.notifications_sent += 1,
                        Err(err) => {
                            stats.notification_failures += 1;
                            span.in_scope(|| {
                                warn!(channel = self.notifier.channel(), error = %err, "failed to send deal alert")
                            });
                        }
                    }
                }
            }
        }

        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub search_start: NaiveDate,
    pub provider: String,
    pub origins: Vec<String>,
    pub destinations: usize,
    pub priced_destinations: usize,
    #[serde(flatten)]
    pub stats: RunStats,
    pub report_dir: Option<String>,
}

pub fn build_provider(
    config: &SyncConfig,
    http: Arc<HttpFetcher>,
) -> Result<Box<dyn QuoteProvider>, ConfigError> {
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "using fixture quote provider");
        return Ok(Box::new(FixtureQuoteProvider::new(dir.clone())));
    }
    let Some(key) = &config.serpapi_key else {
        return Err(ConfigError::NoProvider);
    };
    info!(serpapi_key = "set", "using SerpApi Google Flights provider");
    let mut settings = SerpApiSettings::new(key.expose());
    settings.currency = config.currency.clone();
    settings.language = config.language.clone();
    let provider = SerpApiQuoteProvider::new(http, settings);
    Ok(match &config.archive_dir {
        Some(dir) => Box::new(provider.with_archive(ResponseArchive::new(dir.clone()))),
        None => Box::new(provider),
    })
}

pub struct SyncPipeline {
    config: SyncConfig,
    runner: Runner,
    store: Arc<dyn RecordStore>,
    provider_id: &'static str,
    ledger: Option<DestinationLedger>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let provider = build_provider(&config, Arc::clone(&http))?;
        let notifier = notifier_for(http, config.twilio.clone());
        let store: Arc<dyn RecordStore> = Arc::new(JsonLedgerStore::new(config.ledger_path.clone()));
        Ok(Self::with_parts(config, provider, store, notifier)?)
    }

    /// Assemble a pipeline around explicit collaborators. Search settings are
    /// validated; provider settings are not, since the provider is given.
    pub fn with_parts(
        config: SyncConfig,
        provider: Box<dyn QuoteProvider>,
        store: Arc<dyn RecordStore>,
        notifier: Box<dyn Notifier>,
    ) -> Result<Self, ConfigError> {
        let sampler = config.search_sampler()?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let optimizer = SearchOptimizer::new(sampler, config.max_iterations);
        let provider_id = provider.provider_id();
        let runner = Runner::new(
            optimizer,
            config.origins.clone(),
            provider,
            Arc::clone(&store),
            notifier,
            rng,
        );
        Ok(Self {
            config,
            runner,
            store,
            provider_id,
            ledger: None,
        })
    }

    pub fn ledger(&self) -> Option<&DestinationLedger> {
        self.ledger.as_ref()
    }

    pub async fn run_once(&mut self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let search_start =
            started_at.date_naive() + ChronoDuration::days(i64::from(self.config.start_delay_days));

        if self.ledger.is_none() {
            let seeds = load_seed_destinations(self.config.destinations_file.as_deref())?;
            self.ledger = Some(DestinationLedger::load_or_seed(self.store.as_ref(), seeds).await?);
        }
        let Some(ledger) = self.ledger.as_mut() else {
            anyhow::bail!("destination ledger unavailable");
        };

        info!(
            %run_id,
            %search_start,
            origins = ?self.config.origins,
            destinations = ledger.len(),
            max_iterations = self.config.max_iterations,
            "starting deal search"
        );
        let stats = self.runner.run(ledger, search_start).await;

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            search_start,
            provider: self.provider_id.to_string(),
            origins: self.config.origins.clone(),
            destinations: ledger.len(),
            priced_destinations: ledger.priced_count(),
            stats,
            report_dir: None,
        };

        if let Some(reports_root) = &self.config.reports_dir {
            let dir = write_run_report(reports_root, &summary, ledger.records()).await?;
            summary.report_dir = Some(dir.display().to_string());
        }

        info!(
            %run_id,
            queries = summary.stats.queries,
            improvements = summary.stats.improvements,
            persistence_failures = summary.stats.persistence_failures,
            "deal search finished"
        );
        Ok(summary)
    }
}

/// Scheduler that runs the pipeline on `cron`; runs never overlap.
pub async fn build_scheduler(pipeline: Arc<Mutex<SyncPipeline>>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let mut pipeline = pipeline.lock().await;
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    improvements = summary.stats.improvements,
                    "scheduled run complete"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Scheduler for `config.sync_cron`, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<Mutex<SyncPipeline>>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline, &config.sync_cron).await.map(Some)
}

/// Run on the configured cron until Ctrl-C.
pub async fn run_scheduled_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let cron = config.sync_cron.clone();
    let pipeline = Arc::new(Mutex::new(SyncPipeline::new(config.clone())?));
    let Some(mut sched) = maybe_build_scheduler(&config, pipeline).await? else {
        anyhow::bail!("scheduler disabled; set FDF_SCHEDULER_ENABLED=true to run on FDF_SYNC_CRON");
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let mut pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}

pub async fn load_ledger_from_env() -> Result<Vec<DestinationRecord>> {
    let config = SyncConfig::from_env()?;
    JsonLedgerStore::new(config.ledger_path).load().await
}

/// Write `run_summary.json` and `deal_brief.md` under `<root>/<run_id>/`.
pub async fn write_run_report(
    root: &Path,
    summary: &SyncRunSummary,
    records: &[DestinationRecord],
) -> Result<PathBuf> {
    let report_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&report_dir)
        .await
        .with_context(|| format!("creating {}", report_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(report_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let deals = if summary.stats.deals.is_empty() {
        "- none".to_string()
    } else {
        summary
            .stats
            .deals
            .iter()
            .map(|d| {
                let was = match d.previous {
                    BestPrice::Priced(amount) => format!("was ${amount:.2}"),
                    BestPrice::Unpriced => "first price".to_string(),
                };
                format!(
                    "- {} → {} ({}): ${} ({was}), {} – {}",
                    d.origin,
                    d.destination,
                    d.city,
                    format_amount(d.price),
                    d.departure_date,
                    d.return_date
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let brief = format!(
        "# FDF Deal Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Search start: {}\n- Provider: {}\n- Queries: {} ({} failed)\n- Improvements: {}\n\n## New Lows\n{}\n\n## Ledger\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.search_start,
        summary.provider,
        summary.stats.queries,
        summary.stats.failed_queries,
        summary.stats.improvements,
        deals,
        render_ledger_markdown(records)
    );
    fs::write(report_dir.join("deal_brief.md"), brief)
        .await
        .context("writing deal_brief.md")?;

    Ok(report_dir)
}

pub fn render_ledger_markdown(records: &[DestinationRecord]) -> String {
    let mut lines = vec![
        "| City | IATA | Best price | Dates | Outbound | Inbound |".to_string(),
        "|---|---|---|---|---|---|".to_string(),
    ];
    for record in records {
        let price = match record.best_price() {
            BestPrice::Priced(amount) => format!("${}", format_amount(amount)),
            BestPrice::Unpriced => "unpriced".to_string(),
        };
        let (dates, outbound, inbound) = match record.itinerary() {
            Some(it) => (
                format!("{} – {}", it.departure_date, it.return_date),
                format!("{} {}", it.outbound_airline, it.flight_code_outbound),
                format!("{} {}", it.inbound_airline, it.flight_code_inbound),
            ),
            None => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} |",
            record.city(),
            record.iata_code(),
            price,
            dates,
            outbound,
            inbound
        ));
    }
    lines.join("\n")
}

//! Quote provider and notifier contracts plus their concrete adapters.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use fdf_core::{FlightLeg, Offer, PriceInsights, PriceRange, SearchWindow};
use fdf_storage::{FetchError, HttpFetcher, ResponseArchive};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const SERPAPI_ENDPOINT: &str = "https://serpapi.com/search";
pub const TWILIO_API_BASE: &str = "https://api.twilio.com/";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("provider reported an error: {0}")]
    Provider(String),
    #[error("no offers available")]
    NoOffers,
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("malformed provider response: {0}")]
    Parse(String),
}

/// Flight search seam: the cheapest round trip for one origin/destination/window.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn query(
        &self,
        origin: &str,
        destination: &str,
        window: &SearchWindow,
    ) -> Result<Offer, QueryError>;
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

fn required_str(value: &JsonValue, path: &[&str]) -> Result<String, QueryError> {
    json_str(value, path)
        .map(ToString::to_string)
        .ok_or_else(|| QueryError::Parse(format!("missing string at {}", path.join("."))))
}

fn required_minutes(value: &JsonValue, path: &[&str]) -> Result<u32, QueryError> {
    json_f64(value, path)
        .filter(|v| *v >= 0.0)
        .map(|v| v.round() as u32)
        .ok_or_else(|| QueryError::Parse(format!("missing duration at {}", path.join("."))))
}

fn leg_from_segment(segment: &JsonValue, stopovers: u32) -> Result<FlightLeg, QueryError> {
    Ok(FlightLeg {
        airline: required_str(segment, &["airline"])?,
        flight_number: required_str(segment, &["flight_number"])?,
        departure_time: required_str(segment, &["departure_airport", "time"])?,
        arrival_time: required_str(segment, &["arrival_airport", "time"])?,
        stopovers,
        duration_minutes: required_minutes(segment, &["duration"])?,
    })
}

fn parse_price_insights(value: &JsonValue) -> PriceInsights {
    let Some(insights) = value.get("price_insights") else {
        return PriceInsights::default();
    };
    let typical_price_range = insights
        .get("typical_price_range")
        .and_then(JsonValue::as_array)
        .and_then(|range| match range.as_slice() {
            [low, high] => Some(PriceRange {
                low: low.as_f64()?,
                high: high.as_f64()?,
            }),
            _ => None,
        });
    PriceInsights {
        lowest_price: json_f64(insights, &["lowest_price"]),
        price_level: json_str(insights, &["price_level"]).map(ToString::to_string),
        typical_price_range,
    }
}

/// Reduce a Google Flights response (SerpApi shape) to its cheapest offer.
///
/// `best_flights` and `other_flights` are pooled; the first option at the
/// minimum price wins. The outbound leg is the first segment and the return leg
/// the last one. Stopovers per leg are `segments / 2 - 1`, floored at zero.
pub fn parse_google_flights_response(
    origin: &str,
    destination: &str,
    window: &SearchWindow,
    value: &JsonValue,
) -> Result<Offer, QueryError> {
    if let Some(err) = value.get("error") {
        let message = err
            .as_str()
            .map(ToString::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(QueryError::Provider(message));
    }

    let options = ["best_flights", "other_flights"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(JsonValue::as_array))
        .flatten();

    let mut cheapest: Option<(f64, &JsonValue)> = None;
    for option in options {
        let Some(price) = json_f64(option, &["price"]) else {
            continue;
        };
        if cheapest.map_or(true, |(best, _)| price < best) {
            cheapest = Some((price, option));
        }
    }
    let Some((total_price, option)) = cheapest else {
        return Err(QueryError::NoOffers);
    };

    let segments = option
        .get("flights")
        .and_then(JsonValue::as_array)
        .filter(|segments| !segments.is_empty())
        .ok_or_else(|| QueryError::Parse("cheapest option has no flight segments".into()))?;
    let stopovers = (segments.len() / 2).saturating_sub(1) as u32;
    let first = &segments[0];
    let last = &segments[segments.len() - 1];

    Ok(Offer {
        total_price,
        origin_city: origin.to_string(),
        origin_airport: required_str(first, &["departure_airport", "id"])?,
        destination_city: destination.to_string(),
        destination_airport: required_str(last, &["arrival_airport", "id"])?,
        departure_date: window.departure_date,
        return_date: window.return_date,
        trip_duration_days: window.duration_days().max(0) as u32,
        outbound: leg_from_segment(first, stopovers)?,
        inbound: leg_from_segment(last, stopovers)?,
        insights: parse_price_insights(value),
    })
}

#[derive(Debug, Clone)]
pub struct SerpApiSettings {
    pub api_key: String,
    pub currency: String,
    pub language: String,
    pub endpoint: String,
}

impl SerpApiSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            currency: "USD".to_string(),
            language: "en".to_string(),
            endpoint: SERPAPI_ENDPOINT.to_string(),
        }
    }
}

/// Google Flights through SerpApi.
pub struct SerpApiQuoteProvider {
    http: Arc<HttpFetcher>,
    settings: SerpApiSettings,
    archive: Option<ResponseArchive>,
}

impl SerpApiQuoteProvider {
    pub fn new(http: Arc<HttpFetcher>, settings: SerpApiSettings) -> Self {
        Self {
            http,
            settings,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn request_url(
        &self,
        origin: &str,
        destination: &str,
        window: &SearchWindow,
    ) -> Result<Url, QueryError> {
        let outbound = window.departure_date.format("%Y-%m-%d").to_string();
        let inbound = window.return_date.format("%Y-%m-%d").to_string();
        Url::parse_with_params(
            &self.settings.endpoint,
            &[
                ("engine", "google_flights"),
                ("departure_id", origin),
                ("arrival_id", destination),
                ("outbound_date", outbound.as_str()),
                ("return_date", inbound.as_str()),
                ("currency", self.settings.currency.as_str()),
                ("hl", self.settings.language.as_str()),
                ("api_key", self.settings.api_key.as_str()),
            ],
        )
        .map_err(|e| QueryError::Parse(format!("invalid SerpApi endpoint: {e}")))
    }
}

#[async_trait]
impl QuoteProvider for SerpApiQuoteProvider {
    fn provider_id(&self) -> &'static str {
        "serpapi-google-flights"
    }

    async fn query(
        &self,
        origin: &str,
        destination: &str,
        window: &SearchWindow,
    ) -> Result<Offer, QueryError> {
        let url = self.request_url(origin, destination, window)?;
        let response = self.http.get_bytes(self.provider_id(), &url).await?;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store_bytes(Utc::now(), self.provider_id(), "json", &response.body)
                .await
            {
                warn!(error = %err, "failed to archive provider response");
            }
        }

        let value: JsonValue = serde_json::from_slice(&response.body)
            .map_err(|e| QueryError::Parse(format!("invalid JSON body: {e}")))?;
        parse_google_flights_response(origin, destination, window, &value)
    }
}

/// Offline provider answering from captured SerpApi responses.
///
/// Looks up `<ORIGIN>-<DEST>.json` first, then `<DEST>.json`; a destination
/// with neither file has no offers.
#[derive(Debug, Clone)]
pub struct FixtureQuoteProvider {
    dir: PathBuf,
}

impl FixtureQuoteProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn fixture_path(&self, origin: &str, destination: &str) -> Option<PathBuf> {
        [
            self.dir.join(format!("{origin}-{destination}.json")),
            self.dir.join(format!("{destination}.json")),
        ]
        .into_iter()
        .find(|path| path.exists())
    }
}

fn read_json_file(path: &Path) -> Result<JsonValue> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl QuoteProvider for FixtureQuoteProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn query(
        &self,
        origin: &str,
        destination: &str,
        window: &SearchWindow,
    ) -> Result<Offer, QueryError> {
        let Some(path) = self.fixture_path(origin, destination) else {
            return Err(QueryError::NoOffers);
        };
        let value = read_json_file(&path).map_err(|e| QueryError::Parse(format!("{e:#}")))?;
        parse_google_flights_response(origin, destination, window, &value)
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("notifier misconfigured: {0}")]
    Config(String),
}

/// Outbound message channel for deal alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Fallback channel that only writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        info!(channel = self.channel(), "{text}");
        Ok(())
    }
}

#[derive(Clone)]
pub struct TwilioCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub to_number: String,
}

impl fmt::Debug for TwilioCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioCredentials")
            .field("account_sid", &"*".repeat(self.account_sid.len()))
            .field("auth_token", &"<redacted>")
            .field("from_number", &self.from_number)
            .field("to_number", &self.to_number)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TwilioMessageResponse {
    sid: String,
}

pub struct TwilioWhatsAppNotifier {
    http: Arc<HttpFetcher>,
    credentials: TwilioCredentials,
    api_base: String,
}

impl TwilioWhatsAppNotifier {
    pub fn new(http: Arc<HttpFetcher>, credentials: TwilioCredentials) -> Self {
        Self {
            http,
            credentials,
            api_base: TWILIO_API_BASE.to_string(),
        }
    }

    pub fn messages_url(&self) -> Result<Url, NotifyError> {
        let base = Url::parse(&self.api_base)
            .map_err(|e| NotifyError::Config(format!("invalid Twilio base url: {e}")))?;
        base.join(&format!(
            "2010-04-01/Accounts/{}/Messages.json",
            self.credentials.account_sid
        ))
        .map_err(|e| NotifyError::Config(format!("invalid Twilio account sid: {e}")))
    }
}

#[async_trait]
impl Notifier for TwilioWhatsAppNotifier {
    fn channel(&self) -> &'static str {
        "twilio-whatsapp"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let url = self.messages_url()?;
        let from = format!("whatsapp:{}", self.credentials.from_number);
        let to = format!("whatsapp:{}", self.credentials.to_number);
        let response = self
            .http
            .post_form(
                self.channel(),
                &url,
                Some((
                    self.credentials.account_sid.as_str(),
                    self.credentials.auth_token.as_str(),
                )),
                &[("From", from.as_str()), ("To", to.as_str()), ("Body", text)],
            )
            .await?;

        match serde_json::from_slice::<TwilioMessageResponse>(&response.body) {
            Ok(message) => info!(sid = %message.sid, "WhatsApp message sent"),
            Err(_) => info!(status = response.status.as_u16(), "WhatsApp message accepted"),
        }
        Ok(())
    }
}

/// Twilio when credentials are complete, otherwise the log-only fallback.
pub fn notifier_for(http: Arc<HttpFetcher>, credentials: Option<TwilioCredentials>) -> Box<dyn Notifier> {
    match credentials {
        Some(credentials) => {
            info!(
                account_sid = "set",
                from = %credentials.from_number,
                to = %credentials.to_number,
                "Twilio WhatsApp notifier configured"
            );
            Box::new(TwilioWhatsAppNotifier::new(http, credentials))
        }
        None => {
            warn!("Twilio credentials not set; deal alerts will only be logged");
            Box::new(LogNotifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use fdf_storage::HttpClientConfig;
    use serde_json::json;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn window() -> SearchWindow {
        SearchWindow::starting_at(NaiveDate::from_ymd_opt(2026, 7, 14).unwrap(), 8)
    }

    fn segment(from: &str, to: &str, flight_number: &str, duration: u32) -> JsonValue {
        json!({
            "departure_airport": { "id": from, "time": "2026-07-14 06:20" },
            "arrival_airport": { "id": to, "time": "2026-07-14 18:45" },
            "duration": duration,
            "airline": "Copa Airlines",
            "flight_number": flight_number
        })
    }

    #[test]
    fn captured_response_yields_cheapest_option() {
        let value = read_json_file(&workspace_root().join("fixtures/serpapi/ASU-CDG.json"))
            .expect("fixture");
        let offer = parse_google_flights_response("ASU", "CDG", &window(), &value).unwrap();

        assert_eq!(offer.total_price, 1042.0);
        assert_eq!(offer.origin_airport, "ASU");
        assert_eq!(offer.destination_airport, "CDG");
        assert_eq!(offer.outbound.flight_number, "UX 24");
        assert_eq!(offer.outbound.airline, "Air Europa");
        assert_eq!(offer.outbound.duration_minutes, 735);
        assert_eq!(offer.inbound.flight_number, "UX 1027");
        assert_eq!(offer.inbound.arrival_time, "2026-07-15 21:05");
        assert_eq!(offer.outbound.stopovers, 0);
        assert_eq!(offer.trip_duration_days, 8);
        assert_eq!(offer.insights.price_level.as_deref(), Some("typical"));
        assert_eq!(
            offer.insights.typical_price_range,
            Some(PriceRange { low: 980.0, high: 1450.0 })
        );
        assert!(offer.within_typical_range());
    }

    #[test]
    fn error_payload_maps_to_provider_error() {
        let value = json!({ "error": "Invalid API key." });
        let err = parse_google_flights_response("ASU", "CDG", &window(), &value).unwrap_err();
        assert!(matches!(err, QueryError::Provider(msg) if msg == "Invalid API key."));
    }

    #[test]
    fn empty_result_sets_are_no_offers() {
        let value = json!({ "best_flights": [], "other_flights": [] });
        let err = parse_google_flights_response("ASU", "LIM", &window(), &value).unwrap_err();
        assert!(matches!(err, QueryError::NoOffers));

        let unpriced = json!({ "other_flights": [{ "flights": [segment("ASU", "LIM", "CM 1", 90)] }] });
        let err = parse_google_flights_response("ASU", "LIM", &window(), &unpriced).unwrap_err();
        assert!(matches!(err, QueryError::NoOffers));
    }

    #[test]
    fn price_ties_keep_first_option() {
        let value = json!({
            "best_flights": [
                { "price": 800, "flights": [segment("ASU", "CUN", "CM 100", 120), segment("PTY", "CUN", "CM 200", 150)] }
            ],
            "other_flights": [
                { "price": 800, "flights": [segment("ASU", "CUN", "CM 900", 120), segment("PTY", "CUN", "CM 901", 150)] }
            ]
        });
        let offer = parse_google_flights_response("ASU", "CUN", &window(), &value).unwrap();
        assert_eq!(offer.outbound.flight_number, "CM 100");
        assert_eq!(offer.insights, PriceInsights::default());
    }

    #[test]
    fn stopovers_follow_segment_count_and_floor_at_zero() {
        let single = json!({ "best_flights": [{ "price": 300, "flights": [segment("ASU", "GRU", "LA 1", 110)] }] });
        let offer = parse_google_flights_response("ASU", "GRU", &window(), &single).unwrap();
        assert_eq!(offer.outbound.stopovers, 0);

        let six = json!({ "best_flights": [{ "price": 900, "flights": [
            segment("ASU", "GRU", "LA 1", 110),
            segment("GRU", "LIS", "TP 2", 600),
            segment("LIS", "ATH", "TP 3", 240),
            segment("ATH", "LIS", "TP 4", 250),
            segment("LIS", "GRU", "TP 5", 610),
            segment("GRU", "ASU", "LA 6", 115)
        ] }] });
        let offer = parse_google_flights_response("ASU", "ATH", &window(), &six).unwrap();
        assert_eq!(offer.outbound.stopovers, 2);
        assert_eq!(offer.inbound.stopovers, 2);
        assert_eq!(offer.inbound.flight_number, "LA 6");
    }

    #[test]
    fn missing_segment_fields_are_parse_errors() {
        let value = json!({ "best_flights": [{ "price": 500, "flights": [{ "airline": "Gol" }] }] });
        let err = parse_google_flights_response("ASU", "GIG", &window(), &value).unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));
    }

    #[test]
    fn request_url_carries_google_flights_params() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let provider = SerpApiQuoteProvider::new(http, SerpApiSettings::new("k3y"));
        let url = provider.request_url("ASU", "HND", &window()).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert!(pairs.contains(&("engine".into(), "google_flights".into())));
        assert!(pairs.contains(&("outbound_date".into(), "2026-07-14".into())));
        assert!(pairs.contains(&("return_date".into(), "2026-07-22".into())));
        assert!(pairs.contains(&("arrival_id".into(), "HND".into())));
        assert!(pairs.contains(&("currency".into(), "USD".into())));
    }

    #[test]
    fn twilio_url_targets_account_messages() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let notifier = TwilioWhatsAppNotifier::new(
            http,
            TwilioCredentials {
                account_sid: "AC123".into(),
                auth_token: "secret".into(),
                from_number: "+14155238886".into(),
                to_number: "+595981000000".into(),
            },
        );
        assert_eq!(
            notifier.messages_url().unwrap().as_str(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[test]
    fn twilio_credentials_debug_hides_token() {
        let creds = TwilioCredentials {
            account_sid: "AC123".into(),
            auth_token: "secret".into(),
            from_number: "+1".into(),
            to_number: "+2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("AC123"));
    }

    #[tokio::test]
    async fn fixture_provider_prefers_route_specific_files() {
        let provider = FixtureQuoteProvider::new(workspace_root().join("fixtures/serpapi"));

        let offer = provider.query("ASU", "CDG", &window()).await.unwrap();
        assert_eq!(offer.total_price, 1042.0);

        let err = provider.query("ASU", "BER", &window()).await.unwrap_err();
        assert!(matches!(err, QueryError::Provider(_)));

        let err = provider.query("ASU", "SYD", &window()).await.unwrap_err();
        assert!(matches!(err, QueryError::NoOffers));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        assert!(LogNotifier.send("Low price alert!").await.is_ok());
    }

    #[test]
    fn missing_credentials_fall_back_to_log_channel() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        assert_eq!(notifier_for(http, None).channel(), "log");
    }
}

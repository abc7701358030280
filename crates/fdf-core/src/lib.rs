//! Core domain model for FDF: offers, search windows and ledger records.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Destinations tracked when no ledger has been persisted yet.
pub const SEED_DESTINATIONS: &[(&str, &str)] = &[
    ("Paris", "CDG"),
    ("Berlin", "BER"),
    ("Tokyo", "HND"),
    ("Sydney", "SYD"),
    ("Istanbul", "IST"),
    ("Kuala Lumpur", "KUL"),
    ("New York", "JFK"),
    ("San Francisco", "SFO"),
    ("Cape Town", "CPT"),
    ("Rio de Janeiro", "GIG"),
    ("Lima", "LIM"),
    ("Cancun", "CUN"),
    ("Dubai", "DXB"),
    ("Bangkok", "BKK"),
    ("Rome", "FCO"),
    ("Barcelona", "BCN"),
    ("Amsterdam", "AMS"),
    ("Prague", "PRG"),
    ("Vienna", "VIE"),
    ("Athens", "ATH"),
];

pub fn seed_records() -> Vec<DestinationRecord> {
    SEED_DESTINATIONS
        .iter()
        .map(|(city, code)| DestinationRecord::unpriced(*city, *code))
        .collect()
}

/// Three uppercase ASCII letters, e.g. `ASU`.
pub fn is_iata_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}

/// Lowest total price ever observed for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "amount", rename_all = "snake_case")]
pub enum BestPrice {
    #[default]
    Unpriced,
    Priced(f64),
}

impl BestPrice {
    pub fn amount(&self) -> Option<f64> {
        match self {
            BestPrice::Unpriced => None,
            BestPrice::Priced(amount) => Some(*amount),
        }
    }

    pub fn is_priced(&self) -> bool {
        matches!(self, BestPrice::Priced(_))
    }

    /// True only when `price` is strictly lower than the recorded best.
    /// Non-finite prices never win.
    pub fn is_beaten_by(&self, price: f64) -> bool {
        if !price.is_finite() {
            return false;
        }
        match self {
            BestPrice::Unpriced => true,
            BestPrice::Priced(best) => price < *best,
        }
    }
}

/// Inclusive range of whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRange {
    pub min: u32,
    pub max: u32,
}

impl DayRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn is_ordered(&self) -> bool {
        self.min <= self.max
    }

    pub fn contains(&self, days: i64) -> bool {
        days >= i64::from(self.min) && days <= i64::from(self.max)
    }
}

/// A sampled departure/return pair for one provider query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchWindow {
    pub departure_date: NaiveDate,
    pub return_date: NaiveDate,
}

impl SearchWindow {
    pub fn starting_at(departure_date: NaiveDate, duration_days: u32) -> Self {
        Self {
            departure_date,
            return_date: departure_date + Duration::days(i64::from(duration_days)),
        }
    }

    pub fn duration_days(&self) -> i64 {
        (self.return_date - self.departure_date).num_days()
    }

    pub fn offset_from(&self, search_start: NaiveDate) -> i64 {
        (self.departure_date - search_start).num_days()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub low: f64,
    pub high: f64,
}

/// Market context reported alongside an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PriceInsights {
    pub lowest_price: Option<f64>,
    pub price_level: Option<String>,
    pub typical_price_range: Option<PriceRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightLeg {
    pub airline: String,
    pub flight_number: String,
    pub departure_time: String,
    pub arrival_time: String,
    pub stopovers: u32,
    pub duration_minutes: u32,
}

impl FlightLeg {
    pub fn duration_label(&self) -> String {
        format!(
            "{} hours {} minutes",
            self.duration_minutes / 60,
            self.duration_minutes % 60
        )
    }
}

/// Cheapest round trip returned by one provider query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub total_price: f64,
    pub origin_city: String,
    pub origin_airport: String,
    pub destination_city: String,
    pub destination_airport: String,
    pub departure_date: NaiveDate,
    pub return_date: NaiveDate,
    pub trip_duration_days: u32,
    pub outbound: FlightLeg,
    pub inbound: FlightLeg,
    pub insights: PriceInsights,
}

impl Offer {
    /// Whether the price sits at or under the upper bound of the reported
    /// typical range. Offers without a typical range never qualify.
    pub fn within_typical_range(&self) -> bool {
        self.insights
            .typical_price_range
            .is_some_and(|range| self.total_price <= range.high)
    }
}

/// Itinerary fields of the offer that last lowered a destination's price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItinerarySnapshot {
    pub departure_city: String,
    pub departure_airport: String,
    pub arrival_city: String,
    pub arrival_airport: String,
    pub flight_code_outbound: String,
    pub flight_code_inbound: String,
    pub departure_date: NaiveDate,
    pub return_date: NaiveDate,
    pub trip_duration_days: u32,
    pub stopovers_outbound: u32,
    pub stopovers_inbound: u32,
    pub flight_time_outbound_minutes: u32,
    pub flight_time_inbound_minutes: u32,
    pub outbound_airline: String,
    pub inbound_airline: String,
}

impl From<&Offer> for ItinerarySnapshot {
    fn from(offer: &Offer) -> Self {
        Self {
            departure_city: offer.origin_city.clone(),
            departure_airport: offer.origin_airport.clone(),
            arrival_city: offer.destination_city.clone(),
            arrival_airport: offer.destination_airport.clone(),
            flight_code_outbound: offer.outbound.flight_number.clone(),
            flight_code_inbound: offer.inbound.flight_number.clone(),
            departure_date: offer.departure_date,
            return_date: offer.return_date,
            trip_duration_days: offer.trip_duration_days,
            stopovers_outbound: offer.outbound.stopovers,
            stopovers_inbound: offer.inbound.stopovers,
            flight_time_outbound_minutes: offer.outbound.duration_minutes,
            flight_time_inbound_minutes: offer.inbound.duration_minutes,
            outbound_airline: offer.outbound.airline.clone(),
            inbound_airline: offer.inbound.airline.clone(),
        }
    }
}

/// One ledger row. The best price only moves through [`DestinationRecord::record_offer`],
/// which keeps it monotonically non-increasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    city: String,
    iata_code: String,
    best_price: BestPrice,
    #[serde(default)]
    itinerary: Option<ItinerarySnapshot>,
    #[serde(default)]
    last_improved_at: Option<DateTime<Utc>>,
}

impl DestinationRecord {
    pub fn unpriced(city: impl Into<String>, iata_code: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            iata_code: iata_code.into(),
            best_price: BestPrice::Unpriced,
            itinerary: None,
            last_improved_at: None,
        }
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn iata_code(&self) -> &str {
        &self.iata_code
    }

    pub fn best_price(&self) -> BestPrice {
        self.best_price
    }

    pub fn itinerary(&self) -> Option<&ItinerarySnapshot> {
        self.itinerary.as_ref()
    }

    pub fn last_improved_at(&self) -> Option<DateTime<Utc>> {
        self.last_improved_at
    }

    /// Adopt `offer` if it strictly undercuts the current best price.
    /// Returns the price it replaced, or `None` when the record is unchanged.
    pub fn record_offer(&mut self, offer: &Offer, at: DateTime<Utc>) -> Option<BestPrice> {
        if !self.best_price.is_beaten_by(offer.total_price) {
            return None;
        }
        let previous = self.best_price;
        self.best_price = BestPrice::Priced(offer.total_price);
        self.itinerary = Some(ItinerarySnapshot::from(offer));
        self.last_improved_at = Some(at);
        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn leg(flight_number: &str, duration_minutes: u32) -> FlightLeg {
        FlightLeg {
            airline: "LATAM".into(),
            flight_number: flight_number.into(),
            departure_time: "2026-04-02 08:15".into(),
            arrival_time: "2026-04-02 20:40".into(),
            stopovers: 1,
            duration_minutes,
        }
    }

    fn offer(total_price: f64) -> Offer {
        Offer {
            total_price,
            origin_city: "ASU".into(),
            origin_airport: "ASU".into(),
            destination_city: "CDG".into(),
            destination_airport: "CDG".into(),
            departure_date: date(2026, 4, 2),
            return_date: date(2026, 4, 10),
            trip_duration_days: 8,
            outbound: leg("LA 1320", 745),
            inbound: leg("LA 8065", 690),
            insights: PriceInsights::default(),
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn first_offer_prices_an_unpriced_record() {
        let mut record = DestinationRecord::unpriced("Paris", "CDG");
        let previous = record.record_offer(&offer(450.0), ts());

        assert_eq!(previous, Some(BestPrice::Unpriced));
        assert_eq!(record.best_price(), BestPrice::Priced(450.0));
        assert_eq!(record.last_improved_at(), Some(ts()));
        let itinerary = record.itinerary().expect("snapshot");
        assert_eq!(itinerary.flight_code_outbound, "LA 1320");
        assert_eq!(itinerary.flight_time_inbound_minutes, 690);
        assert_eq!(itinerary.trip_duration_days, 8);
    }

    #[test]
    fn equal_or_higher_prices_leave_record_untouched() {
        let mut record = DestinationRecord::unpriced("Paris", "CDG");
        record.record_offer(&offer(400.0), ts());
        let before = record.clone();

        assert_eq!(record.record_offer(&offer(400.0), ts()), None);
        assert_eq!(record.record_offer(&offer(450.0), ts()), None);
        assert_eq!(record, before);
    }

    #[test]
    fn lower_price_replaces_and_reports_previous() {
        let mut record = DestinationRecord::unpriced("Paris", "CDG");
        record.record_offer(&offer(400.0), ts());
        let previous = record.record_offer(&offer(380.5), ts());

        assert_eq!(previous, Some(BestPrice::Priced(400.0)));
        assert_eq!(record.best_price().amount(), Some(380.5));
    }

    #[test]
    fn non_finite_prices_never_win() {
        let unpriced = BestPrice::Unpriced;
        assert!(!unpriced.is_beaten_by(f64::NAN));
        assert!(!unpriced.is_beaten_by(f64::INFINITY));
        assert!(!BestPrice::Priced(100.0).is_beaten_by(f64::NEG_INFINITY));
    }

    #[test]
    fn best_price_serializes_as_tagged_state() {
        let unpriced = serde_json::to_value(BestPrice::Unpriced).unwrap();
        assert_eq!(unpriced, serde_json::json!({ "state": "unpriced" }));

        let priced = serde_json::to_value(BestPrice::Priced(412.37)).unwrap();
        assert_eq!(priced, serde_json::json!({ "state": "priced", "amount": 412.37 }));
    }

    #[test]
    fn search_window_measures_duration_and_offset() {
        let start = date(2026, 3, 1);
        let window = SearchWindow::starting_at(date(2026, 3, 11), 9);

        assert_eq!(window.return_date, date(2026, 3, 20));
        assert_eq!(window.duration_days(), 9);
        assert_eq!(window.offset_from(start), 10);
    }

    #[test]
    fn typical_range_check_uses_upper_bound_inclusively() {
        let mut o = offer(700.0);
        assert!(!o.within_typical_range());

        o.insights.typical_price_range = Some(PriceRange { low: 650.0, high: 700.0 });
        assert!(o.within_typical_range());

        o.total_price = 700.01;
        assert!(!o.within_typical_range());
    }

    #[test]
    fn leg_duration_label_splits_hours_and_minutes() {
        assert_eq!(leg("X", 745).duration_label(), "12 hours 25 minutes");
        assert_eq!(leg("X", 59).duration_label(), "0 hours 59 minutes");
    }

    #[test]
    fn seed_destinations_are_unique_iata_codes() {
        let records = seed_records();
        assert_eq!(records.len(), 20);
        let codes: HashSet<_> = records.iter().map(|r| r.iata_code()).collect();
        assert_eq!(codes.len(), records.len());
        assert!(records.iter().all(|r| is_iata_code(r.iata_code())));
        assert!(records.iter().all(|r| !r.best_price().is_priced()));
    }

    #[test]
    fn iata_code_check() {
        assert!(is_iata_code("ASU"));
        assert!(!is_iata_code("asu"));
        assert!(!is_iata_code("ASUN"));
        assert!(!is_iata_code("A1U"));
    }
}

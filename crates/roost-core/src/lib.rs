//! Canonical record model and change detection for Roost.
//!
//! Every scraped entity is normalized into one of the typed payloads below
//! before it goes anywhere near a store. The payload structs carry only the
//! fields that matter for change detection, so a plain field-by-field
//! comparison *is* the allow-list comparison.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CRATE_NAME: &str = "roost-core";

/// The distinct record categories, each with its own storage destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Calendar,
    Reviews,
    Listing,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Calendar => "calendar",
            EntityKind::Reviews => "reviews",
            EntityKind::Listing => "listing",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic change detection between a stored payload and a fresh one.
///
/// Implementations compare only semantically meaningful fields and are
/// order-insensitive for keyed collections, since source ordering is not
/// stable across fetches. Missing and null are the same value: both map to
/// `None` during normalization, so the comparison never distinguishes them.
pub trait SemanticDiff {
    fn differs_from(&self, existing: &Self) -> bool;
}

/// Whether a freshly normalized payload must be written over the stored one.
///
/// No prior record always forces the initial write.
pub fn needs_write<P: SemanticDiff>(existing: Option<&P>, incoming: &P) -> bool {
    match existing {
        None => true,
        Some(prev) => incoming.differs_from(prev),
    }
}

fn keyed_by<'a, T, K, F>(items: &'a [T], key: F) -> HashMap<K, &'a T>
where
    K: Eq + Hash,
    F: Fn(&'a T) -> K,
{
    items.iter().map(|item| (key(item), item)).collect()
}

/// Order-insensitive comparison of two keyed collections: equal cardinality,
/// equal key-set, and item equality for every shared key.
fn keyed_collections_differ<T, K, F>(existing: &[T], incoming: &[T], key: F) -> bool
where
    T: PartialEq,
    K: Eq + Hash,
    F: Fn(&T) -> K + Copy,
{
    if existing.len() != incoming.len() {
        return true;
    }
    let old = keyed_by(existing, key);
    let new = keyed_by(incoming, key);
    if old.len() != new.len() {
        return true;
    }
    new.iter().any(|(k, incoming_item)| match old.get(k) {
        Some(existing_item) => existing_item != incoming_item,
        None => true,
    })
}

// ---------------------------------------------------------------------------
// Calendar
// ---------------------------------------------------------------------------

/// One day of an availability calendar. Only the fields compared for change
/// detection are kept; UI-only hints from the source are dropped at
/// normalization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarDay {
    pub calendar_date: String,
    pub available: Option<bool>,
    pub available_for_checkin: Option<bool>,
    pub available_for_checkout: Option<bool>,
    pub bookable: Option<bool>,
    pub min_nights: Option<i64>,
    pub max_nights: Option<i64>,
    pub price_formatted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarMonth {
    pub month: u32,
    pub year: i32,
    pub days: Vec<CalendarDay>,
}

/// Twelve-ish months of availability for one listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarPayload {
    pub months: Vec<CalendarMonth>,
}

impl SemanticDiff for CalendarPayload {
    fn differs_from(&self, existing: &Self) -> bool {
        if existing.months.len() != self.months.len() {
            return true;
        }
        let old = keyed_by(&existing.months, |m| (m.year, m.month));
        let new = keyed_by(&self.months, |m| (m.year, m.month));
        if old.len() != new.len() {
            return true;
        }
        new.iter().any(|(key, incoming)| match old.get(key) {
            Some(prev) => {
                keyed_collections_differ(&prev.days, &incoming.days, |d| d.calendar_date.clone())
            }
            None => true,
        })
    }
}

/// Aggregates recomputed from the calendar payload on every write. Never
/// diffed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarStats {
    pub total_days: u64,
    pub available_days: u64,
    pub bookable_days: u64,
    pub availability_rate: f64,
    pub bookable_rate: f64,
}

impl CalendarStats {
    pub fn of(payload: &CalendarPayload) -> Self {
        let mut total = 0u64;
        let mut available = 0u64;
        let mut bookable = 0u64;
        for month in &payload.months {
            total += month.days.len() as u64;
            for day in &month.days {
                if day.available.unwrap_or(false) {
                    available += 1;
                }
                if day.bookable.unwrap_or(false) {
                    bookable += 1;
                }
            }
        }
        Self {
            total_days: total,
            available_days: available,
            bookable_days: bookable,
            availability_rate: percentage(available, total),
            bookable_rate: percentage(bookable, total),
        }
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0 * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Reviews
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reviewer {
    pub first_name: Option<String>,
    pub picture_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub external_id: String,
    pub reviewer: Reviewer,
    pub language: Option<String>,
    pub created_at: Option<String>,
    pub rating: Option<i64>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewsPayload {
    pub reviews: Vec<Review>,
}

impl SemanticDiff for ReviewsPayload {
    fn differs_from(&self, existing: &Self) -> bool {
        keyed_collections_differ(&existing.reviews, &self.reviews, |r| r.external_id.clone())
    }
}

/// Merge reviews from another source into an existing list, deduplicating by
/// external id. The first occurrence wins; only previously-unseen reviews are
/// appended, in their incoming order.
pub fn merge_reviews(existing: &mut Vec<Review>, incoming: impl IntoIterator<Item = Review>) {
    let mut seen: HashSet<String> = existing.iter().map(|r| r.external_id.clone()).collect();
    for review in incoming {
        if seen.insert(review.external_id.clone()) {
            existing.push(review);
        }
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingImage {
    pub id: Option<String>,
    pub orientation: Option<String>,
    pub accessibility_label: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomTourItem {
    pub title: Option<String>,
    pub image_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policies {
    pub house_rules: Vec<String>,
    pub safety_properties: Vec<String>,
    pub house_rules_subtitle: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptionSection {
    pub title: Option<String>,
    pub html_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Amenity {
    pub title: Option<String>,
    pub available: bool,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmenityGroup {
    pub group_title: Option<String>,
    pub amenities: Vec<Amenity>,
}

/// One category rating as the source reports it: a localized decimal string
/// such as `"4,83"` plus an optional percentage bar width.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryRating {
    pub category: Option<String>,
    pub localized_rating: Option<String>,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NightlyPrice {
    pub amount: i64,
    pub currency: Option<String>,
}

/// Everything extracted from one listing's detail sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingPayload {
    pub name: Option<String>,
    pub person_capacity: Option<i64>,
    pub property_type: Option<String>,
    pub picture_url: Option<String>,
    pub shared_location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_description: Option<String>,
    pub images: Vec<ListingImage>,
    pub room_tour_items: Vec<RoomTourItem>,
    pub ratings: Vec<CategoryRating>,
    pub policies: Policies,
    pub highlights: Vec<Highlight>,
    pub descriptions: Vec<DescriptionSection>,
    pub amenity_groups: Vec<AmenityGroup>,
    pub nightly_price: Option<NightlyPrice>,
}

impl SemanticDiff for ListingPayload {
    fn differs_from(&self, existing: &Self) -> bool {
        self != existing
    }
}

/// Category rating points flattened for the relational side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingPoints {
    pub cleanliness: f64,
    pub location: f64,
    pub service: f64,
    pub value: f64,
    pub communication: f64,
    pub convenience: f64,
}

impl RatingPoints {
    pub fn from_categories(ratings: &[CategoryRating]) -> Self {
        let mut points = Self::default();
        for rating in ratings {
            let value = rating
                .localized_rating
                .as_deref()
                .map(parse_localized_rating)
                .unwrap_or(0.0);
            match rating.category.as_deref() {
                Some("CLEANLINESS") => points.cleanliness = value,
                Some("LOCATION") => points.location = value,
                Some("ACCURACY") => points.service = value,
                Some("VALUE") => points.value = value,
                Some("COMMUNICATION") => points.communication = value,
                Some("CHECKIN") => points.convenience = value,
                _ => {}
            }
        }
        points
    }
}

/// Parse a localized decimal rating string leniently: decimal commas become
/// dots, stray line breaks and whitespace are stripped. Unparseable input
/// degrades to 0.0 rather than failing the record.
pub fn parse_localized_rating(raw: &str) -> f64 {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return 0.0;
    }
    match cleaned.parse::<f64>() {
        Ok(value) => value,
        Err(_) => {
            warn!(raw, "unparseable rating value, defaulting to 0.0");
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Upsert outcomes and batch statistics
// ---------------------------------------------------------------------------

/// What the executor did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Skipped,
}

/// Per-batch counters, threaded through the ingest loop as an explicit
/// accumulator and returned at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errored: u64,
}

impl IngestStats {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        self.processed += 1;
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn record_error(&mut self) {
        self.processed += 1;
        self.errored += 1;
    }

    /// Records that actually hit storage.
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }

    pub fn absorb(&mut self, other: IngestStats) {
        self.processed += other.processed;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errored += other.errored;
    }
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} inserted={} updated={} skipped={} errored={}",
            self.processed, self.inserted, self.updated, self.skipped, self.errored
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(date: &str, available: bool) -> CalendarDay {
        CalendarDay {
            calendar_date: date.to_string(),
            available: Some(available),
            available_for_checkin: Some(available),
            available_for_checkout: Some(true),
            bookable: Some(available),
            min_nights: Some(1),
            max_nights: Some(30),
            price_formatted: Some("₫1,200,000".to_string()),
        }
    }

    fn month(year: i32, month_no: u32, days: Vec<CalendarDay>) -> CalendarMonth {
        CalendarMonth {
            month: month_no,
            year,
            days,
        }
    }

    fn review(id: &str, rating: i64) -> Review {
        Review {
            external_id: id.to_string(),
            reviewer: Reviewer {
                first_name: Some("Linh".to_string()),
                picture_url: None,
            },
            language: Some("vi".to_string()),
            created_at: Some("2024-05-01T00:00:00Z".to_string()),
            rating: Some(rating),
            comments: Some("Tuyệt vời".to_string()),
        }
    }

    #[test]
    fn missing_prior_record_forces_write() {
        let incoming = CalendarPayload {
            months: vec![month(2024, 6, vec![day("2024-06-01", true)])],
        };
        assert!(needs_write(None, &incoming));
    }

    #[test]
    fn identical_calendar_is_not_different() {
        let a = CalendarPayload {
            months: vec![month(2024, 6, vec![day("2024-06-01", true), day("2024-06-02", false)])],
        };
        let b = a.clone();
        assert!(!needs_write(Some(&a), &b));
    }

    #[test]
    fn day_order_is_ignored() {
        let stored = CalendarPayload {
            months: vec![month(2024, 6, vec![day("2024-06-01", true), day("2024-06-02", false)])],
        };
        let permuted = CalendarPayload {
            months: vec![month(2024, 6, vec![day("2024-06-02", false), day("2024-06-01", true)])],
        };
        assert!(!permuted.differs_from(&stored));
    }

    #[test]
    fn availability_flip_is_different() {
        let stored = CalendarPayload {
            months: vec![month(2024, 6, vec![day("2024-06-01", true)])],
        };
        let incoming = CalendarPayload {
            months: vec![month(2024, 6, vec![day("2024-06-01", false)])],
        };
        assert!(incoming.differs_from(&stored));
    }

    #[test]
    fn changed_month_keyset_is_different() {
        let stored = CalendarPayload {
            months: vec![month(2024, 6, vec![day("2024-06-01", true)])],
        };
        let incoming = CalendarPayload {
            months: vec![month(2024, 7, vec![day("2024-07-01", true)])],
        };
        assert!(incoming.differs_from(&stored));
    }

    #[test]
    fn empty_vs_empty_is_not_different() {
        let stored = CalendarPayload::default();
        let incoming = CalendarPayload::default();
        assert!(!incoming.differs_from(&stored));
        let nonempty = CalendarPayload {
            months: vec![month(2024, 6, vec![day("2024-06-01", true)])],
        };
        assert!(nonempty.differs_from(&stored));
    }

    #[test]
    fn review_order_is_ignored_but_content_is_not() {
        let stored = ReviewsPayload {
            reviews: vec![review("a", 5), review("b", 4)],
        };
        let permuted = ReviewsPayload {
            reviews: vec![review("b", 4), review("a", 5)],
        };
        assert!(!permuted.differs_from(&stored));

        let changed = ReviewsPayload {
            reviews: vec![review("a", 5), review("b", 3)],
        };
        assert!(changed.differs_from(&stored));
    }

    #[test]
    fn merge_keeps_first_occurrence_and_appends_unseen() {
        let mut merged = vec![review("1", 5), review("2", 4), review("3", 5)];
        merge_reviews(&mut merged, vec![review("3", 1), review("4", 2)]);
        let ids: Vec<&str> = merged.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        // first occurrence of "3" wins
        assert_eq!(merged[2].rating, Some(5));
    }

    #[test]
    fn calendar_stats_rates_are_rounded_percentages() {
        let payload = CalendarPayload {
            months: vec![month(
                2024,
                6,
                vec![day("2024-06-01", true), day("2024-06-02", true), day("2024-06-03", false)],
            )],
        };
        let stats = CalendarStats::of(&payload);
        assert_eq!(stats.total_days, 3);
        assert_eq!(stats.available_days, 2);
        assert_eq!(stats.availability_rate, 66.67);
        assert_eq!(CalendarStats::of(&CalendarPayload::default()).availability_rate, 0.0);
    }

    #[test]
    fn rating_parse_is_lenient() {
        assert_eq!(parse_localized_rating("4,83"), 4.83);
        assert_eq!(parse_localized_rating(" 4.9\n"), 4.9);
        assert_eq!(parse_localized_rating("n/a"), 0.0);
        assert_eq!(parse_localized_rating(""), 0.0);
    }

    #[test]
    fn rating_points_map_source_categories() {
        let ratings = vec![
            CategoryRating {
                category: Some("CLEANLINESS".to_string()),
                localized_rating: Some("4,8".to_string()),
                percentage: None,
            },
            CategoryRating {
                category: Some("CHECKIN".to_string()),
                localized_rating: Some("5.0".to_string()),
                percentage: None,
            },
            CategoryRating {
                category: Some("UNKNOWN".to_string()),
                localized_rating: Some("1.0".to_string()),
                percentage: None,
            },
        ];
        let points = RatingPoints::from_categories(&ratings);
        assert_eq!(points.cleanliness, 4.8);
        assert_eq!(points.convenience, 5.0);
        assert_eq!(points.value, 0.0);
    }

    #[test]
    fn stats_accumulator_counts_outcomes() {
        let mut stats = IngestStats::default();
        stats.record(UpsertOutcome::Inserted);
        stats.record(UpsertOutcome::Skipped);
        stats.record_error();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.written(), 1);
        assert_eq!(stats.errored, 1);

        let mut total = IngestStats::default();
        total.absorb(stats);
        assert_eq!(total.processed, 3);
    }
}

//! Marketplace GraphQL client + raw snapshot storage for Roost.
//!
//! The marketplace exposes its listing data through persisted GraphQL
//! queries: a GET per operation, addressed by the operation's sha256 hash.
//! Hash discovery is handled out-of-band; this crate consumes a YAML catalog
//! of the current hashes and knows how to shape each operation's variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-client";

/// Stable listing identifier in the marketplace's GraphQL id space.
pub fn encode_listing_id(listing_id: &str) -> String {
    BASE64.encode(format!("StayListing:{listing_id}"))
}

// ---------------------------------------------------------------------------
// Operation catalog
// ---------------------------------------------------------------------------

/// One persisted GraphQL operation: its public name and the sha256 hash the
/// API routes it by.
#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    pub name: String,
    pub sha256: String,
}

/// The four operations the pipeline depends on, loaded from a YAML catalog
/// that is refreshed whenever the marketplace rotates its hashes.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationCatalog {
    pub listing_sections: Operation,
    pub reviews: Operation,
    pub availability_calendar: Operation,
    pub checkout: Operation,
}

impl OperationCatalog {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Transport errors and retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

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
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// API client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_domain: String,
    pub api_key: String,
    pub user_agent: String,
    pub locale: String,
    pub currency: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

#[derive(Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ClientConfig,
    catalog: OperationCatalog,
}

impl ApiClient {
    pub fn new(config: ClientConfig, catalog: OperationCatalog) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            config,
            catalog,
        })
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    /// Twelve months of availability starting from the current month. Returns
    /// the raw month objects; missing response structure degrades to empty.
    pub async fn fetch_calendar(&self, listing_id: &str) -> Result<Vec<JsonValue>, FetchError> {
        let today = Utc::now().date_naive();
        let variables = json!({
            "request": {
                "count": 12,
                "listingId": listing_id,
                "month": today.month(),
                "year": today.year(),
            }
        });
        let body = self
            .graphql_get(&self.catalog.availability_calendar, listing_id, &variables)
            .await?;
        Ok(array_at(
            &body,
            &["data", "merlin", "pdpAvailabilityCalendar", "calendarMonths"],
        ))
    }

    /// First page of reviews, best-quality sort, anchored on a near-future
    /// one-night stay the way the web client does.
    pub async fn fetch_reviews(&self, listing_id: &str) -> Result<Vec<JsonValue>, FetchError> {
        let today = Utc::now().date_naive();
        let checkin = today + Days::new(7);
        let checkout = today + Days::new(8);
        let variables = json!({
            "id": encode_listing_id(listing_id),
            "useContextualUser": false,
            "pdpReviewsRequest": {
                "fieldSelector": "for_p3_translation_only",
                "forPreview": false,
                "limit": 24,
                "offset": "0",
                "showingTranslationButton": false,
                "first": 24,
                "sortingPreference": "BEST_QUALITY",
                "checkinDate": checkin.to_string(),
                "checkoutDate": checkout.to_string(),
                "numberOfAdults": "1",
                "numberOfChildren": "0",
                "numberOfInfants": "0",
                "numberOfPets": "0",
            }
        });
        let body = self
            .graphql_get(&self.catalog.reviews, listing_id, &variables)
            .await?;
        Ok(array_at(
            &body,
            &["data", "presentation", "stayProductDetailPage", "reviews", "reviews"],
        ))
    }

    /// The listing detail page sections plus its sharing metadata, as one raw
    /// object for the normalizer to walk.
    pub async fn fetch_listing_sections(&self, listing_id: &str) -> Result<JsonValue, FetchError> {
        let variables = json!({
            "id": encode_listing_id(listing_id),
            "wishlistTenantIntegrationEnabled": true,
            "pdpSectionsRequest": {
                "adults": "1",
                "layouts": ["SIDEBAR", "SINGLE_COLUMN"],
                "pets": 0,
                "preview": false,
                "bypassTargetings": false,
            }
        });
        let body = self
            .graphql_get(&self.catalog.listing_sections, listing_id, &variables)
            .await?;
        Ok(dig(&body, &["data", "presentation", "stayProductDetailPage", "sections"])
            .cloned()
            .unwrap_or(JsonValue::Null))
    }

    /// Probe checkout pricing over a fixed ladder of future stay windows.
    /// First window that yields price items wins; exhausting the ladder is not
    /// an error, it just means the listing had no quotable window.
    pub async fn fetch_price_items(&self, listing_id: &str) -> Result<Vec<JsonValue>, FetchError> {
        for (checkin, checkout) in price_probe_windows(Utc::now().date_naive()) {
            debug!(listing_id, %checkin, %checkout, "probing checkout price window");
            let variables = json!({
                "input": {
                    "businessTravel": { "workTrip": false },
                    "checkinDate": checkin.to_string(),
                    "checkoutDate": checkout.to_string(),
                    "guestCounts": {
                        "numberOfAdults": 1,
                        "numberOfChildren": 0,
                        "numberOfInfants": 0,
                        "numberOfPets": 0,
                    },
                    "guestCurrencyOverride": self.config.currency,
                    "listingDetail": {},
                    "lux": {},
                    "metadata": { "internalFlags": [] },
                    "org": {},
                    "productId": encode_listing_id(listing_id),
                    "addOn": { "carbonOffsetParams": { "isSelected": false } },
                    "quickPayData": null,
                }
            });
            let body = match self
                .graphql_get(&self.catalog.checkout, listing_id, &variables)
                .await
            {
                Ok(body) => body,
                Err(err) => {
                    warn!(listing_id, %checkin, error = %err, "price window probe failed");
                    continue;
                }
            };
            let items = array_at(
                &body,
                &[
                    "data",
                    "presentation",
                    "stayCheckout",
                    "sections",
                    "temporaryQuickPayData",
                    "bootstrapPayments",
                    "productPriceBreakdown",
                    "priceBreakdown",
                    "priceItems",
                ],
            );
            if !items.is_empty() {
                return Ok(items);
            }
        }
        warn!(listing_id, "no price window yielded price items");
        Ok(Vec::new())
    }

    async fn graphql_get(
        &self,
        op: &Operation,
        listing_id: &str,
        variables: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        let url = format!("{}/api/v3/{}/{}", self.config.api_domain, op.name, op.sha256);
        let variables_text = variables.to_string();
        let extensions_text = json!({
            "persistedQuery": { "version": 1, "sha256Hash": op.sha256 }
        })
        .to_string();
        let backoff = self.config.backoff;
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            let request = self
                .http
                .get(&url)
                .header("X-Api-Key", &self.config.api_key)
                .header("X-GraphQL-Platform", "web")
                .header("X-Csrf-Without-Token", "1")
                .header(header::CONTENT_TYPE, "application/json")
                .header(
                    header::REFERER,
                    format!("{}/rooms/{}", self.config.api_domain, listing_id),
                )
                .query(&[
                    ("operationName", op.name.as_str()),
                    ("locale", self.config.locale.as_str()),
                    ("currency", self.config.currency.as_str()),
                    ("variables", variables_text.as_str()),
                    ("extensions", extensions_text.as_str()),
                ]);

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.json().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(match last_request_error {
            Some(err) => FetchError::Request(err),
            None => FetchError::HttpStatus {
                status: 0,
                url,
            },
        })
    }
}

/// Checkin/checkout day-offset ladder used when probing for a quotable price.
/// Ordered attempts, one-night stays, no backoff between windows.
const PRICE_PROBE_OFFSETS: [(u64, u64); 12] = [
    (7, 8),
    (10, 11),
    (14, 15),
    (20, 21),
    (30, 31),
    (45, 46),
    (60, 61),
    (75, 76),
    (90, 91),
    (120, 121),
    (150, 151),
    (180, 181),
];

pub fn price_probe_windows(today: NaiveDate) -> impl Iterator<Item = (NaiveDate, NaiveDate)> {
    PRICE_PROBE_OFFSETS
        .into_iter()
        .map(move |(checkin, checkout)| (today + Days::new(checkin), today + Days::new(checkout)))
}

/// Walk a JSON object path, `None` as soon as a segment is missing.
pub fn dig<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

fn array_at(value: &JsonValue, path: &[&str]) -> Vec<JsonValue> {
    dig(value, path)
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Raw snapshot store
// ---------------------------------------------------------------------------

/// Where a raw response body landed on disk.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, content-hash-addressed storage for raw fetched bodies. Replays
/// of identical bytes dedup to the existing file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
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

    fn snapshot_relative_path(
        fetched_at: DateTime<Utc>,
        operation: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(operation)
            .join(format!("{content_hash}.json"))
    }

    /// Store one raw body under a date-stamped, hash-addressed path, writing
    /// through a temp file and an atomic rename.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        operation: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::snapshot_relative_path(fetched_at, operation, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .context("snapshot path has no parent")?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            // Another writer beat us to the same content hash.
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredSnapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming snapshot into place at {}", absolute_path.display())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn listing_id_encoding_matches_graphql_id_space() {
        assert_eq!(encode_listing_id("12345"), "U3RheUxpc3Rpbmc6MTIzNDU=");
    }

    #[test]
    fn catalog_parses_from_yaml() {
        let yaml = r#"
listing_sections:
  name: StaysPdpSections
  sha256: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
reviews:
  name: StaysPdpReviewsQuery
  sha256: bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb
availability_calendar:
  name: PdpAvailabilityCalendar
  sha256: cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc
checkout:
  name: StayCheckout
  sha256: dddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd
"#;
        let catalog: OperationCatalog = serde_yaml::from_str(yaml).expect("catalog yaml");
        assert_eq!(catalog.availability_calendar.name, "PdpAvailabilityCalendar");
        assert_eq!(catalog.checkout.sha256.len(), 64);
    }

    #[test]
    fn price_probe_ladder_is_ordered_one_night_stays() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).expect("date");
        let windows: Vec<_> = price_probe_windows(today).collect();
        assert_eq!(windows.len(), 12);
        assert_eq!(
            windows[0],
            (
                NaiveDate::from_ymd_opt(2024, 6, 8).expect("date"),
                NaiveDate::from_ymd_opt(2024, 6, 9).expect("date")
            )
        );
        for (checkin, checkout) in &windows {
            assert_eq!(*checkout, *checkin + Days::new(1));
        }
        assert!(windows.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }

    #[test]
    fn dig_walks_nested_objects() {
        let value = json!({"data": {"merlin": {"calendarMonths": [1, 2]}}});
        assert!(dig(&value, &["data", "merlin", "calendarMonths"]).is_some());
        assert!(dig(&value, &["data", "missing"]).is_none());
        assert_eq!(
            array_at(&value, &["data", "merlin", "calendarMonths"]).len(),
            2
        );
        assert!(array_at(&value, &["data", "missing"]).is_empty());
    }

    #[test]
    fn retry_classification_covers_throttling() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(700),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(700));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(700));
    }

    #[test]
    fn snapshot_hash_is_stable() {
        assert_eq!(
            SnapshotStore::sha256_hex(b"{\"calendarMonths\":[]}"),
            SnapshotStore::sha256_hex(b"{\"calendarMonths\":[]}"),
        );
        assert_ne!(
            SnapshotStore::sha256_hex(b"{}"),
            SnapshotStore::sha256_hex(b"[]"),
        );
    }

    #[tokio::test]
    async fn identical_bodies_dedup_to_one_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2024-06-01T08:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(fetched_at, "PdpAvailabilityCalendar", b"{\"months\":[]}")
            .await
            .expect("first store");
        let second = store
            .store_bytes(fetched_at, "PdpAvailabilityCalendar", b"{\"months\":[]}")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }
}

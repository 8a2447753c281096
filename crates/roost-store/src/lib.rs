//! Persistence for Roost: a MongoDB document store with a differential
//! upsert executor, and a MySQL relational store for the structured listing
//! side.
//!
//! Document writes are full replacements, keyed by the external listing id,
//! and only happen when the change detector reports a semantic difference.

use std::collections::HashSet;

use async_trait::async_trait;
use bson::{doc, Bson};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use roost_core::{
    CalendarPayload, CalendarStats, DescriptionSection, EntityKind, Highlight, ListingImage,
    ListingPayload, Policies, RatingPoints, ReviewsPayload, RoomTourItem, SemanticDiff,
    UpsertOutcome,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions};
use sqlx::{Row, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "roost-store";

/// Field every canonical document is keyed by.
pub const KEY_FIELD: &str = "listing_id";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to document store: {0}")]
    DocumentConnect(#[source] mongodb::error::Error),
    #[error("connecting to relational store: {0}")]
    RelationalConnect(#[source] sqlx::Error),
    #[error("{kind} lookup for key {key}: {source}")]
    Read {
        kind: EntityKind,
        key: String,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("{kind} upsert for key {key}: {source}")]
    Write {
        kind: EntityKind,
        key: String,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("listing row upsert for key {key}: {source}")]
    ListingRow {
        key: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("relational schema setup: {0}")]
    Schema(#[source] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Canonical documents
// ---------------------------------------------------------------------------

/// A keyed document with full-replacement upsert semantics.
pub trait CanonicalDoc: Serialize + DeserializeOwned + Unpin + Send + Sync {
    const COLLECTION: &'static str;
    const KIND: EntityKind;

    fn key(&self) -> &str;

    /// Allow-list comparison against the stored document.
    fn differs_from(&self, existing: &Self) -> bool;

    /// Recompute derived fields and stamp `updated_at` just before a write.
    fn prepare_for_write(&mut self);

    fn secondary_indexes() -> Vec<IndexModel> {
        Vec::new()
    }
}

fn secondary_index(name: &str, field: &str) -> IndexModel {
    IndexModel::builder()
        .keys(doc! { field: 1 })
        .options(IndexOptions::builder().name(name.to_string()).build())
        .build()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarDoc {
    pub listing_id: String,
    #[serde(flatten)]
    pub calendar: CalendarPayload,
    pub stats: CalendarStats,
    pub updated_at: bson::DateTime,
}

impl CalendarDoc {
    pub fn new(listing_id: impl Into<String>, calendar: CalendarPayload) -> Self {
        let stats = CalendarStats::of(&calendar);
        Self {
            listing_id: listing_id.into(),
            calendar,
            stats,
            updated_at: bson::DateTime::now(),
        }
    }
}

impl CanonicalDoc for CalendarDoc {
    const COLLECTION: &'static str = "calendars";
    const KIND: EntityKind = EntityKind::Calendar;

    fn key(&self) -> &str {
        &self.listing_id
    }

    fn differs_from(&self, existing: &Self) -> bool {
        self.calendar.differs_from(&existing.calendar)
    }

    fn prepare_for_write(&mut self) {
        self.stats = CalendarStats::of(&self.calendar);
        self.updated_at = bson::DateTime::now();
    }

    fn secondary_indexes() -> Vec<IndexModel> {
        vec![
            secondary_index("calendar_date_index", "months.days.calendar_date"),
            secondary_index("calendar_available_index", "months.days.available"),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewsDoc {
    pub listing_id: String,
    #[serde(flatten)]
    pub payload: ReviewsPayload,
    pub total_reviews: u64,
    pub updated_at: bson::DateTime,
}

impl ReviewsDoc {
    pub fn new(listing_id: impl Into<String>, payload: ReviewsPayload) -> Self {
        let total_reviews = payload.reviews.len() as u64;
        Self {
            listing_id: listing_id.into(),
            payload,
            total_reviews,
            updated_at: bson::DateTime::now(),
        }
    }
}

impl CanonicalDoc for ReviewsDoc {
    const COLLECTION: &'static str = "reviews";
    const KIND: EntityKind = EntityKind::Reviews;

    fn key(&self) -> &str {
        &self.listing_id
    }

    fn differs_from(&self, existing: &Self) -> bool {
        self.payload.differs_from(&existing.payload)
    }

    fn prepare_for_write(&mut self) {
        self.total_reviews = self.payload.reviews.len() as u64;
        self.updated_at = bson::DateTime::now();
    }

    fn secondary_indexes() -> Vec<IndexModel> {
        vec![secondary_index("review_external_id_index", "reviews.external_id")]
    }
}

/// The document-store projection of a listing: the nested, schema-flexible
/// content that has no good relational shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingContent {
    pub images: Vec<ListingImage>,
    pub room_tour_items: Vec<RoomTourItem>,
    pub policies: Policies,
    pub highlights: Vec<Highlight>,
    pub descriptions: Vec<DescriptionSection>,
}

impl ListingContent {
    pub fn project(listing: &ListingPayload) -> Self {
        Self {
            images: listing.images.clone(),
            room_tour_items: listing.room_tour_items.clone(),
            policies: listing.policies.clone(),
            highlights: listing.highlights.clone(),
            descriptions: listing.descriptions.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingContentDoc {
    pub listing_id: String,
    #[serde(flatten)]
    pub content: ListingContent,
    pub updated_at: bson::DateTime,
}

impl ListingContentDoc {
    pub fn new(listing_id: impl Into<String>, content: ListingContent) -> Self {
        Self {
            listing_id: listing_id.into(),
            content,
            updated_at: bson::DateTime::now(),
        }
    }
}

impl CanonicalDoc for ListingContentDoc {
    const COLLECTION: &'static str = "listing_content";
    const KIND: EntityKind = EntityKind::Listing;

    fn key(&self) -> &str {
        &self.listing_id
    }

    fn differs_from(&self, existing: &Self) -> bool {
        self.content != existing.content
    }

    fn prepare_for_write(&mut self) {
        self.updated_at = bson::DateTime::now();
    }
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

/// MongoDB-backed store for the nested entity kinds.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    db: Database,
}

impl DocumentStore {
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, StoreError> {
        // Bounded server selection so an unreachable instance fails fast
        // instead of hanging the batch.
        let timeout_uri = if uri.contains('?') {
            format!("{uri}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000")
        } else {
            format!("{uri}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000")
        };
        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(StoreError::DocumentConnect)?;
        let db = client.database(db_name);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(StoreError::DocumentConnect)?;
        info!(db = db_name, "connected to document store");
        Ok(Self { db })
    }

    fn collection<D: CanonicalDoc>(&self) -> Collection<D> {
        self.db.collection(D::COLLECTION)
    }

    /// Index maintenance for one entity kind. Null-keyed documents would
    /// violate the unique key index, so they are purged first. Every failure
    /// here degrades to slower lookups rather than aborting the batch.
    pub async fn ensure_indexes<D: CanonicalDoc>(&self) {
        let coll = self.collection::<D>();

        match coll.delete_many(doc! { KEY_FIELD: Bson::Null }).await {
            Ok(result) if result.deleted_count > 0 => {
                info!(kind = %D::KIND, count = result.deleted_count, "purged null-keyed documents");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(kind = %D::KIND, error = %err, "null-key purge failed, skipping index build");
                return;
            }
        }

        // Stale index name from earlier schema revisions.
        let _ = coll.drop_index(format!("{KEY_FIELD}_1")).await;

        let unique = IndexModel::builder()
            .keys(doc! { KEY_FIELD: 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name(format!("{}_key_unique", D::COLLECTION))
                    .build(),
            )
            .build();
        if let Err(err) = coll.create_index(unique).await {
            warn!(kind = %D::KIND, error = %err, "unique key index creation failed");
        }

        for index in D::secondary_indexes() {
            if let Err(err) = coll.create_index(index).await {
                warn!(kind = %D::KIND, error = %err, "secondary index creation failed");
            }
        }
    }

    /// Run maintenance for every canonical collection.
    pub async fn ensure_all_indexes(&self) {
        self.ensure_indexes::<CalendarDoc>().await;
        self.ensure_indexes::<ReviewsDoc>().await;
        self.ensure_indexes::<ListingContentDoc>().await;
    }

    /// The differential upsert: fetch the stored document, skip when nothing
    /// semantically changed, otherwise replace-or-insert atomically.
    pub async fn upsert_document<D: CanonicalDoc>(
        &self,
        mut incoming: D,
    ) -> Result<UpsertOutcome, StoreError> {
        let coll = self.collection::<D>();
        let key = incoming.key().to_string();
        let filter = doc! { KEY_FIELD: &key };

        let existing = coll.find_one(filter.clone()).await.map_err(|source| {
            StoreError::Read {
                kind: D::KIND,
                key: key.clone(),
                source,
            }
        })?;

        if let Some(prev) = &existing {
            if !incoming.differs_from(prev) {
                debug!(kind = %D::KIND, key, "no semantic change, skipping write");
                return Ok(UpsertOutcome::Skipped);
            }
        }

        incoming.prepare_for_write();
        let result = coll
            .replace_one(filter, incoming)
            .upsert(true)
            .await
            .map_err(|source| StoreError::Write {
                kind: D::KIND,
                key: key.clone(),
                source,
            })?;

        Ok(if result.upserted_id.is_some() {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }
}

/// Storage seam the ingest loop writes through, one impl per entity kind.
#[async_trait]
pub trait PayloadWriter<P>: Send + Sync {
    async fn upsert_payload(&self, key: &str, payload: P) -> Result<UpsertOutcome, StoreError>;
}

#[async_trait]
impl PayloadWriter<CalendarPayload> for DocumentStore {
    async fn upsert_payload(
        &self,
        key: &str,
        payload: CalendarPayload,
    ) -> Result<UpsertOutcome, StoreError> {
        self.upsert_document(CalendarDoc::new(key, payload)).await
    }
}

#[async_trait]
impl PayloadWriter<ReviewsPayload> for DocumentStore {
    async fn upsert_payload(
        &self,
        key: &str,
        payload: ReviewsPayload,
    ) -> Result<UpsertOutcome, StoreError> {
        self.upsert_document(ReviewsDoc::new(key, payload)).await
    }
}

#[async_trait]
impl PayloadWriter<ListingPayload> for DocumentStore {
    async fn upsert_payload(
        &self,
        key: &str,
        payload: ListingPayload,
    ) -> Result<UpsertOutcome, StoreError> {
        let content = ListingContent::project(&payload);
        self.upsert_document(ListingContentDoc::new(key, content))
            .await
    }
}

// ---------------------------------------------------------------------------
// Relational store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingRowOutcome {
    Inserted,
    Updated,
    /// The listing's shared-location string matched no known district or
    /// province, so there is no row to anchor it to.
    SkippedNoLocation,
}

#[async_trait]
pub trait ListingRowSink: Send + Sync {
    async fn upsert_listing_row(
        &self,
        key: &str,
        listing: &ListingPayload,
    ) -> Result<ListingRowOutcome, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct LocationMatch {
    pub province_code: Option<String>,
    pub district_code: Option<String>,
}

/// MySQL-backed store for the structured listing side: the listing row, the
/// amenity dictionaries, and the province/district reference data.
#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: MySqlPool,
}

impl RelationalStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(StoreError::RelationalConnect)?;
        info!("connected to relational store");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Schema)?;
        }
        Ok(())
    }

    /// Match a free-form shared-location string against the district
    /// dictionary first (more specific), then provinces. Longest names are
    /// tried first so "Quận 1, Hồ Chí Minh" resolves to the district rather
    /// than the province it mentions.
    pub async fn resolve_location(
        tx: &mut Transaction<'_, MySql>,
        shared_location: &str,
    ) -> Result<LocationMatch, sqlx::Error> {
        let needle = shared_location.to_lowercase();

        let districts = sqlx::query(
            "SELECT district_code, province_code, name, name_en, full_name, full_name_en \
             FROM districts ORDER BY CHAR_LENGTH(name) DESC",
        )
        .fetch_all(&mut **tx)
        .await?;
        for row in districts {
            if row_name_matches(&row, &needle)? {
                return Ok(LocationMatch {
                    province_code: row.try_get("province_code")?,
                    district_code: row.try_get("district_code")?,
                });
            }
        }

        let provinces = sqlx::query(
            "SELECT province_code, name, name_en, full_name, full_name_en \
             FROM provinces ORDER BY CHAR_LENGTH(name) DESC",
        )
        .fetch_all(&mut **tx)
        .await?;
        for row in provinces {
            if row_name_matches(&row, &needle)? {
                return Ok(LocationMatch {
                    province_code: row.try_get("province_code")?,
                    district_code: None,
                });
            }
        }

        Ok(LocationMatch::default())
    }

    async fn compose_address(
        tx: &mut Transaction<'_, MySql>,
        location: &LocationMatch,
    ) -> Result<String, sqlx::Error> {
        let mut province_name: Option<String> = None;
        let mut district_name: Option<String> = None;

        if let Some(code) = &location.province_code {
            province_name = sqlx::query("SELECT name FROM provinces WHERE province_code = ?")
                .bind(code)
                .fetch_optional(&mut **tx)
                .await?
                .map(|row| row.try_get(0))
                .transpose()?;
        }
        if let Some(code) = &location.district_code {
            district_name = sqlx::query("SELECT name FROM districts WHERE district_code = ?")
                .bind(code)
                .fetch_optional(&mut **tx)
                .await?
                .map(|row| row.try_get(0))
                .transpose()?;
        }

        Ok(match (district_name, province_name) {
            (Some(district), Some(province)) => format!("{district}, {province}"),
            (None, Some(province)) => province,
            _ => "N/A".to_string(),
        })
    }

    async fn ensure_property_type(
        tx: &mut Transaction<'_, MySql>,
        name: &str,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query("INSERT IGNORE INTO property_types (name) VALUES (?)")
            .bind(name)
            .execute(&mut **tx)
            .await?;
        let row = sqlx::query("SELECT id FROM property_types WHERE name = ?")
            .bind(name)
            .fetch_one(&mut **tx)
            .await?;
        row.try_get(0)
    }

    async fn ensure_amenity_group(
        tx: &mut Transaction<'_, MySql>,
        name: &str,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query("INSERT IGNORE INTO amenity_groups (name) VALUES (?)")
            .bind(name)
            .execute(&mut **tx)
            .await?;
        let row = sqlx::query("SELECT id FROM amenity_groups WHERE name = ?")
            .bind(name)
            .fetch_one(&mut **tx)
            .await?;
        row.try_get(0)
    }

    async fn ensure_amenity(
        tx: &mut Transaction<'_, MySql>,
        name: &str,
        group_id: i64,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query(
            "INSERT INTO amenities (name, amenity_group_id) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE amenity_group_id = VALUES(amenity_group_id)",
        )
        .bind(name)
        .bind(group_id)
        .execute(&mut **tx)
        .await?;
        let row = sqlx::query("SELECT id FROM amenities WHERE name = ?")
            .bind(name)
            .fetch_one(&mut **tx)
            .await?;
        row.try_get(0)
    }

    /// Replace the listing's amenity link set with the incoming one, touching
    /// only the rows that actually changed.
    async fn replace_listing_amenities(
        tx: &mut Transaction<'_, MySql>,
        listing_row_id: i64,
        amenity_ids: &[i64],
    ) -> Result<(), sqlx::Error> {
        let rows = sqlx::query("SELECT amenity_id FROM listing_amenities WHERE listing_id = ?")
            .bind(listing_row_id)
            .fetch_all(&mut **tx)
            .await?;
        let mut existing = HashSet::new();
        for row in rows {
            existing.insert(row.try_get::<i64, _>(0)?);
        }
        let incoming: HashSet<i64> = amenity_ids.iter().copied().collect();

        for removed in existing.difference(&incoming) {
            sqlx::query("DELETE FROM listing_amenities WHERE listing_id = ? AND amenity_id = ?")
                .bind(listing_row_id)
                .bind(removed)
                .execute(&mut **tx)
                .await?;
        }
        for added in incoming.difference(&existing) {
            sqlx::query("INSERT IGNORE INTO listing_amenities (listing_id, amenity_id) VALUES (?, ?)")
                .bind(listing_row_id)
                .bind(added)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

fn row_name_matches(row: &sqlx::mysql::MySqlRow, needle: &str) -> Result<bool, sqlx::Error> {
    for column in ["name", "name_en", "full_name", "full_name_en"] {
        let candidate: Option<String> = row.try_get(column)?;
        if let Some(name) = candidate {
            if !name.is_empty() && needle.contains(&name.to_lowercase()) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[async_trait]
impl ListingRowSink for RelationalStore {
    async fn upsert_listing_row(
        &self,
        key: &str,
        listing: &ListingPayload,
    ) -> Result<ListingRowOutcome, StoreError> {
        let sql_err = |source: sqlx::Error| StoreError::ListingRow {
            key: key.to_string(),
            source,
        };

        let shared_location = match listing.shared_location.as_deref() {
            Some(location) if !location.is_empty() => location,
            _ => {
                info!(key, "listing has no shared location, skipping relational row");
                return Ok(ListingRowOutcome::SkippedNoLocation);
            }
        };

        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        let location = Self::resolve_location(&mut tx, shared_location)
            .await
            .map_err(sql_err)?;
        if location.province_code.is_none() && location.district_code.is_none() {
            info!(key, shared_location, "location matched no district or province, skipping row");
            return Ok(ListingRowOutcome::SkippedNoLocation);
        }

        let address = Self::compose_address(&mut tx, &location).await.map_err(sql_err)?;
        let property_type_id = match listing.property_type.as_deref() {
            Some(name) if !name.is_empty() => {
                Some(Self::ensure_property_type(&mut tx, name).await.map_err(sql_err)?)
            }
            _ => None,
        };
        let points = RatingPoints::from_categories(&listing.ratings);
        let (nightly_price, currency) = match &listing.nightly_price {
            Some(price) => (Some(price.amount), price.currency.clone()),
            None => (None, None),
        };

        let pre_existing = sqlx::query("SELECT id FROM listings WHERE external_id = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sql_err)?
            .is_some();

        sqlx::query(
            "INSERT INTO listings (external_id, name, address, province_code, district_code, \
             latitude, longitude, property_type_id, max_guests, nightly_price, currency, \
             cleanliness_point, location_point, service_point, value_point, \
             communication_point, convenience_point, created_at, last_synced_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NOW(), NOW()) \
             ON DUPLICATE KEY UPDATE name = VALUES(name), address = VALUES(address), \
             province_code = VALUES(province_code), district_code = VALUES(district_code), \
             latitude = VALUES(latitude), longitude = VALUES(longitude), \
             property_type_id = VALUES(property_type_id), max_guests = VALUES(max_guests), \
             nightly_price = VALUES(nightly_price), currency = VALUES(currency), \
             cleanliness_point = VALUES(cleanliness_point), location_point = VALUES(location_point), \
             service_point = VALUES(service_point), value_point = VALUES(value_point), \
             communication_point = VALUES(communication_point), \
             convenience_point = VALUES(convenience_point), last_synced_at = NOW()",
        )
        .bind(key)
        .bind(&listing.name)
        .bind(&address)
        .bind(&location.province_code)
        .bind(&location.district_code)
        .bind(listing.latitude)
        .bind(listing.longitude)
        .bind(property_type_id)
        .bind(listing.person_capacity)
        .bind(nightly_price)
        .bind(&currency)
        .bind(points.cleanliness)
        .bind(points.location)
        .bind(points.service)
        .bind(points.value)
        .bind(points.communication)
        .bind(points.convenience)
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?;

        let listing_row_id: i64 = sqlx::query("SELECT id FROM listings WHERE external_id = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(sql_err)?
            .try_get(0)
            .map_err(sql_err)?;

        let mut amenity_ids = Vec::new();
        for group in &listing.amenity_groups {
            let group_name = group.group_title.as_deref().unwrap_or("Other");
            let group_id = Self::ensure_amenity_group(&mut tx, group_name)
                .await
                .map_err(sql_err)?;
            for amenity in &group.amenities {
                if !amenity.available {
                    continue;
                }
                if let Some(title) = amenity.title.as_deref().filter(|t| !t.is_empty()) {
                    let amenity_id = Self::ensure_amenity(&mut tx, title, group_id)
                        .await
                        .map_err(sql_err)?;
                    amenity_ids.push(amenity_id);
                }
            }
        }
        Self::replace_listing_amenities(&mut tx, listing_row_id, &amenity_ids)
            .await
            .map_err(sql_err)?;

        tx.commit().await.map_err(sql_err)?;

        Ok(if pre_existing {
            ListingRowOutcome::Updated
        } else {
            ListingRowOutcome::Inserted
        })
    }
}

const SCHEMA_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS provinces ( \
       province_code VARCHAR(16) PRIMARY KEY, \
       name VARCHAR(255) NOT NULL, \
       name_en VARCHAR(255), \
       full_name VARCHAR(255), \
       full_name_en VARCHAR(255) \
     )",
    "CREATE TABLE IF NOT EXISTS districts ( \
       district_code VARCHAR(16) PRIMARY KEY, \
       province_code VARCHAR(16) NOT NULL, \
       name VARCHAR(255) NOT NULL, \
       name_en VARCHAR(255), \
       full_name VARCHAR(255), \
       full_name_en VARCHAR(255) \
     )",
    "CREATE TABLE IF NOT EXISTS property_types ( \
       id BIGINT AUTO_INCREMENT PRIMARY KEY, \
       name VARCHAR(255) NOT NULL UNIQUE \
     )",
    "CREATE TABLE IF NOT EXISTS amenity_groups ( \
       id BIGINT AUTO_INCREMENT PRIMARY KEY, \
       name VARCHAR(255) NOT NULL UNIQUE \
     )",
    "CREATE TABLE IF NOT EXISTS amenities ( \
       id BIGINT AUTO_INCREMENT PRIMARY KEY, \
       name VARCHAR(255) NOT NULL UNIQUE, \
       amenity_group_id BIGINT \
     )",
    "CREATE TABLE IF NOT EXISTS listings ( \
       id BIGINT AUTO_INCREMENT PRIMARY KEY, \
       external_id VARCHAR(64) NOT NULL UNIQUE, \
       name VARCHAR(512), \
       address VARCHAR(512), \
       province_code VARCHAR(16), \
       district_code VARCHAR(16), \
       latitude DOUBLE, \
       longitude DOUBLE, \
       property_type_id BIGINT, \
       max_guests BIGINT, \
       nightly_price BIGINT, \
       currency VARCHAR(8), \
       cleanliness_point DOUBLE, \
       location_point DOUBLE, \
       service_point DOUBLE, \
       value_point DOUBLE, \
       communication_point DOUBLE, \
       convenience_point DOUBLE, \
       created_at DATETIME, \
       last_synced_at DATETIME \
     )",
    "CREATE TABLE IF NOT EXISTS listing_amenities ( \
       listing_id BIGINT NOT NULL, \
       amenity_id BIGINT NOT NULL, \
       PRIMARY KEY (listing_id, amenity_id) \
     )",
];

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::{CalendarDay, CalendarMonth};

    fn payload(dates_available: &[(&str, bool)]) -> CalendarPayload {
        CalendarPayload {
            months: vec![CalendarMonth {
                month: 6,
                year: 2024,
                days: dates_available
                    .iter()
                    .map(|(date, available)| CalendarDay {
                        calendar_date: date.to_string(),
                        available: Some(*available),
                        available_for_checkin: Some(*available),
                        available_for_checkout: Some(true),
                        bookable: Some(*available),
                        min_nights: Some(1),
                        max_nights: Some(365),
                        price_formatted: None,
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn calendar_doc_derives_stats_on_construction() {
        let doc = CalendarDoc::new("42", payload(&[("2024-06-01", true), ("2024-06-02", false)]));
        assert_eq!(doc.stats.total_days, 2);
        assert_eq!(doc.stats.available_days, 1);
        assert_eq!(doc.stats.availability_rate, 50.0);
    }

    #[test]
    fn prepare_for_write_recomputes_stats() {
        let mut doc = CalendarDoc::new("42", payload(&[("2024-06-01", true)]));
        doc.calendar = payload(&[("2024-06-01", false), ("2024-06-02", false)]);
        doc.prepare_for_write();
        assert_eq!(doc.stats.total_days, 2);
        assert_eq!(doc.stats.available_days, 0);
    }

    #[test]
    fn calendar_doc_diff_delegates_to_payload() {
        let stored = CalendarDoc::new("42", payload(&[("2024-06-01", true)]));
        let same = CalendarDoc::new("42", payload(&[("2024-06-01", true)]));
        let flipped = CalendarDoc::new("42", payload(&[("2024-06-01", false)]));
        assert!(!same.differs_from(&stored));
        assert!(flipped.differs_from(&stored));
    }

    #[test]
    fn reviews_doc_total_tracks_payload() {
        let mut doc = ReviewsDoc::new("42", ReviewsPayload::default());
        assert_eq!(doc.total_reviews, 0);
        doc.payload.reviews.push(roost_core::Review {
            external_id: "r1".to_string(),
            reviewer: Default::default(),
            language: None,
            created_at: None,
            rating: Some(5),
            comments: None,
        });
        doc.prepare_for_write();
        assert_eq!(doc.total_reviews, 1);
    }

    #[test]
    fn listing_content_projects_document_side_fields_only() {
        let listing = ListingPayload {
            name: Some("Riverside loft".to_string()),
            images: vec![ListingImage {
                id: Some("img-1".to_string()),
                ..Default::default()
            }],
            highlights: vec![Highlight {
                title: Some("Great location".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let content = ListingContent::project(&listing);
        assert_eq!(content.images.len(), 1);
        assert_eq!(content.highlights.len(), 1);

        let doc_a = ListingContentDoc::new("42", content.clone());
        let doc_b = ListingContentDoc::new("42", content);
        assert!(!doc_b.differs_from(&doc_a));

        let mut renamed = listing.clone();
        renamed.name = Some("Renamed".to_string());
        // the relational-only field does not affect document content
        assert!(!ListingContentDoc::new("42", ListingContent::project(&renamed))
            .differs_from(&doc_a));
    }

    #[test]
    fn canonical_collections_declare_unique_key_material() {
        assert_eq!(CalendarDoc::COLLECTION, "calendars");
        assert_eq!(ReviewsDoc::COLLECTION, "reviews");
        assert_eq!(ListingContentDoc::COLLECTION, "listing_content");
        assert_eq!(CalendarDoc::secondary_indexes().len(), 2);
        assert_eq!(ReviewsDoc::secondary_indexes().len(), 1);
        assert!(ListingContentDoc::secondary_indexes().is_empty());
    }
}

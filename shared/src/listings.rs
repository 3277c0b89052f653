//! Premium and standard listing feeds.
//!
//! The listing API answers either with a bare array or with an envelope carrying `data` and
//! paging totals. [`normalize_listing_response`] is the only place that knows about both.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::capabilities::{ApiClient, HttpError, HttpMethod};
use crate::error::{AppError, ErrorKind};
use crate::model::{format_distance, GeoPoint, RegionId, RoomId, UserId};
use crate::regions::CascadeSelection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Premium,
    Standard,
}

impl Tier {
    pub const ALL: [Self; 2] = [Self::Premium, Self::Standard];

    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Premium => "rooms/vip",
            Self::Standard => "rooms",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Premium => "premium",
            Self::Standard => "standard",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ListingError {
    #[error("listing request failed: {0}")]
    Http(#[from] HttpError),

    #[error("malformed listing response: {0}")]
    Malformed(String),
}

impl ListingError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(e) => e.kind(),
            Self::Malformed(_) => ErrorKind::Deserialization,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_retryable())
    }
}

impl From<ListingError> for AppError {
    fn from(e: ListingError) -> Self {
        let error = AppError::new(e.kind(), e.to_string());
        match &e {
            ListingError::Http(http) => http.annotate(error),
            _ => error,
        }
    }
}

// ============================================================================
// Listing model
// ============================================================================

fn lenient_room_id<'de, D: Deserializer<'de>>(de: D) -> Result<RoomId, D::Error> {
    match Value::deserialize(de)? {
        Value::String(s) if !s.trim().is_empty() => Ok(RoomId::new(s)),
        Value::Number(n) => Ok(RoomId::new(n.to_string())),
        other => Err(serde::de::Error::custom(format!("invalid room id: {other}"))),
    }
}

fn lenient_number<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRoom {
    #[serde(deserialize_with = "lenient_room_id", alias = "roomId")]
    pub id: RoomId,
    #[serde(default, alias = "name")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub price: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub longitude: Option<f64>,
    #[serde(default, alias = "image")]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub distance_m: Option<f64>,
    #[serde(default)]
    pub distance_label: Option<String>,
}

impl ListRoom {
    #[must_use]
    pub fn point(&self) -> Option<GeoPoint> {
        GeoPoint::new(self.latitude?, self.longitude?).ok()
    }

    /// Distance from `origin`, when the room has usable coordinates.
    pub fn annotate_distance(&mut self, origin: GeoPoint) {
        match self.point() {
            Some(point) => {
                let meters = origin.distance_to(point);
                self.distance_m = Some(meters);
                self.distance_label = Some(format_distance(meters));
            }
            None => {
                self.distance_m = None;
                self.distance_label = None;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingPage {
    pub items: Vec<ListRoom>,
    pub page_number: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub total_records: Option<u64>,
}

impl ListingPage {
    #[must_use]
    pub fn empty(page_size: u32) -> Self {
        Self {
            items: Vec::new(),
            page_number: 0,
            page_size,
            total_pages: 0,
            total_records: None,
        }
    }

    #[must_use]
    pub const fn has_next(&self) -> bool {
        self.page_number.saturating_add(1) < self.total_pages
    }

    #[must_use]
    pub fn with_distances(mut self, origin: Option<GeoPoint>) -> Self {
        if let Some(origin) = origin {
            for room in &mut self.items {
                room.annotate_distance(origin);
            }
        }
        self
    }
}

fn as_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_rooms(items: &[Value]) -> Vec<ListRoom> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<ListRoom>(item.clone()) {
            Ok(room) => Some(room),
            Err(e) => {
                debug!(error = %e, "skipping unreadable listing entry");
                None
            }
        })
        .collect()
}

/// One canonical page from either response shape. A bare array is a single full page.
pub fn normalize_listing_response(
    body: &Value,
    page_number: u32,
    page_size: u32,
) -> Result<ListingPage, ListingError> {
    match body {
        Value::Array(items) => Ok(ListingPage {
            items: parse_rooms(items),
            page_number,
            page_size,
            total_pages: 1,
            total_records: u64::try_from(items.len()).ok(),
        }),
        Value::Object(map) => {
            let items: &[Value] = match map.get("data") {
                Some(Value::Array(items)) => items.as_slice(),
                Some(Value::Null) | None => &[],
                Some(_) => return Err(ListingError::Malformed("`data` is not an array".into())),
            };
            let has_next = map.get("hasNext").and_then(Value::as_bool);
            let total_pages = as_u64(map.get("totalPages"))
                .and_then(|t| u32::try_from(t).ok())
                .unwrap_or(match has_next {
                    Some(true) => page_number.saturating_add(2),
                    _ => page_number.saturating_add(1),
                });
            Ok(ListingPage {
                items: parse_rooms(items),
                page_number,
                page_size,
                total_pages,
                total_records: as_u64(map.get("totalRecords")),
            })
        }
        Value::Null => Ok(ListingPage {
            page_number,
            ..ListingPage::empty(page_size)
        }),
        _ => Err(ListingError::Malformed("expected array or object".into())),
    }
}

// ============================================================================
// Fetcher
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionFilter {
    pub province_id: Option<RegionId>,
    pub district_id: Option<RegionId>,
    pub ward_id: Option<RegionId>,
}

impl From<&CascadeSelection> for RegionFilter {
    fn from(selection: &CascadeSelection) -> Self {
        Self {
            province_id: selection.province_id().cloned(),
            district_id: selection.district_id().cloned(),
            ward_id: selection.ward_id().cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingQuery {
    pub tier: Tier,
    pub page: u32,
    pub page_size: u32,
    pub user: Option<UserId>,
    pub point: Option<GeoPoint>,
    pub regions: RegionFilter,
}

impl ListingQuery {
    #[must_use]
    pub fn new(tier: Tier, page: u32, page_size: u32) -> Self {
        Self {
            tier,
            page,
            page_size,
            user: None,
            point: None,
            regions: RegionFilter::default(),
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: Option<UserId>) -> Self {
        self.user = user;
        self
    }

    #[must_use]
    pub fn with_point(mut self, point: Option<GeoPoint>) -> Self {
        self.point = point;
        self
    }

    #[must_use]
    pub fn with_regions(mut self, regions: RegionFilter) -> Self {
        self.regions = regions;
        self
    }
}

pub struct DiscoveryFetcher {
    client: ApiClient,
}

impl DiscoveryFetcher {
    #[must_use]
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Without a point the server applies its default (non-geo) ranking.
    #[instrument(skip(self, query), fields(tier = %query.tier, page = query.page, geo = query.point.is_some()))]
    pub async fn fetch_tier(&self, query: &ListingQuery) -> Result<ListingPage, ListingError> {
        let mut request = self
            .client
            .request(HttpMethod::Get, query.tier.path())?
            .with_query("pageNumber", query.page.to_string())?
            .with_query("pageSize", query.page_size.to_string())?;

        if let Some(user) = &query.user {
            request = request.with_query("userId", user.as_str())?;
        }
        if let Some(point) = query.point {
            request = request
                .with_query("latitude", point.lat().to_string())?
                .with_query("longitude", point.lng().to_string())?;
        }
        let regions = [
            ("provinceId", &query.regions.province_id),
            ("districtId", &query.regions.district_id),
            ("wardId", &query.regions.ward_id),
        ];
        for (key, id) in regions {
            if let Some(id) = id {
                request = request.with_query(key, id.as_str())?;
            }
        }

        let body = self.client.send_json(request).await?;
        let page = normalize_listing_response(&body, query.page, query.page_size)?
            .with_distances(query.point);
        info!(
            items = page.items.len(),
            total_pages = page.total_pages,
            "listing page fetched"
        );
        Ok(page)
    }
}

// ============================================================================
// Per-tier pagination state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedTicket {
    pub tier: Tier,
    pub page: u32,
    generation: u64,
}

/// What the UI shows for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierFeed {
    pub page: ListingPage,
    pub loading: bool,
    pub error: Option<String>,
    #[serde(skip)]
    generation: u64,
}

impl TierFeed {
    fn new(page_size: u32) -> Self {
        Self {
            page: ListingPage::empty(page_size),
            loading: false,
            error: None,
            generation: 0,
        }
    }
}

/// Premium and standard feeds. Each tier has its own page and generation; nothing done to
/// one tier touches the other.
#[derive(Debug, Clone, PartialEq)]
pub struct TierFeeds {
    premium: TierFeed,
    standard: TierFeed,
    page_size: u32,
}

impl TierFeeds {
    #[must_use]
    pub fn new(page_size: u32) -> Self {
        Self {
            premium: TierFeed::new(page_size),
            standard: TierFeed::new(page_size),
            page_size,
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub const fn feed(&self, tier: Tier) -> &TierFeed {
        match tier {
            Tier::Premium => &self.premium,
            Tier::Standard => &self.standard,
        }
    }

    fn feed_mut(&mut self, tier: Tier) -> &mut TierFeed {
        match tier {
            Tier::Premium => &mut self.premium,
            Tier::Standard => &mut self.standard,
        }
    }

    /// Starts a fetch of `page` for `tier`, superseding any fetch in flight for that tier.
    pub fn begin(&mut self, tier: Tier, page: u32) -> FeedTicket {
        let feed = self.feed_mut(tier);
        feed.generation += 1;
        feed.loading = true;
        feed.error = None;
        FeedTicket {
            tier,
            page,
            generation: feed.generation,
        }
    }

    /// Ticket for the next page, or `None` when the tier is on its last page or busy.
    pub fn begin_next(&mut self, tier: Tier) -> Option<FeedTicket> {
        let feed = self.feed(tier);
        if feed.loading || !feed.page.has_next() {
            return None;
        }
        let next = feed.page.page_number.saturating_add(1);
        Some(self.begin(tier, next))
    }

    /// Both tiers back to page 0, invalidating whatever was in flight.
    pub fn reset_all(&mut self) -> [FeedTicket; 2] {
        Tier::ALL.map(|tier| self.begin(tier, 0))
    }

    /// Returns `false` when the ticket was superseded and the result dropped.
    pub fn apply(
        &mut self,
        ticket: &FeedTicket,
        result: Result<ListingPage, ListingError>,
    ) -> bool {
        let feed = self.feed_mut(ticket.tier);
        if feed.generation != ticket.generation {
            debug!(tier = %ticket.tier, page = ticket.page, "discarding stale listing page");
            return false;
        }
        feed.loading = false;
        match result {
            Ok(page) => {
                feed.page = page;
                feed.error = None;
            }
            Err(err) => feed.error = Some(AppError::from(err).user_facing_message()),
        }
        true
    }
}

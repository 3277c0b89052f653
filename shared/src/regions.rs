//! Province → district → ward cascade.
//!
//! [`CascadeState`] is the synchronous state machine: every mutation happens through it, and
//! every child fetch is issued against a [`LoadTicket`] carrying the level's generation at
//! dispatch time. A result whose ticket no longer matches the level's generation is stale and
//! is dropped without touching state. [`RegionCascade`] drives the machine asynchronously and
//! never holds the state lock across a fetch.

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ApiClient, HttpError, HttpMethod};
use crate::error::{AppError, ErrorKind};
use crate::model::RegionId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionNode {
    pub id: RegionId,
    pub name: String,
    pub parent_id: Option<RegionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionLevel {
    Province,
    District,
    Ward,
}

impl RegionLevel {
    const fn index(self) -> usize {
        match self {
            Self::Province => 0,
            Self::District => 1,
            Self::Ward => 2,
        }
    }
}

impl fmt::Display for RegionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Province => "province",
            Self::District => "district",
            Self::Ward => "ward",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("region request failed: {0}")]
    Http(#[from] HttpError),

    #[error("malformed region response: {0}")]
    Malformed(String),

    #[error("select a {0} first")]
    ParentNotSelected(RegionLevel),

    #[error("{0} options superseded by a newer selection")]
    Stale(RegionLevel),
}

impl RegionError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(e) => e.kind(),
            Self::Malformed(_) => ErrorKind::Deserialization,
            Self::ParentNotSelected(_) => ErrorKind::Validation,
            Self::Stale(_) => ErrorKind::StaleResult,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_retryable())
    }

    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

impl From<RegionError> for AppError {
    fn from(e: RegionError) -> Self {
        let error = AppError::new(e.kind(), e.to_string());
        match &e {
            RegionError::Http(http) => http.annotate(error),
            _ => error,
        }
    }
}

// ============================================================================
// Wire parsing
// ============================================================================

fn id_from(value: &Value) -> Option<RegionId> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(RegionId::new(s.trim())),
        Value::Number(n) => Some(RegionId::new(n.to_string())),
        _ => None,
    }
}

/// Accepts a bare array or `{data: array}` of `{id, name}`. Entries without an id or name
/// are skipped.
pub fn parse_region_list(
    body: &Value,
    parent: Option<&RegionId>,
) -> Result<Vec<RegionNode>, RegionError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(items)) => items,
            _ => return Err(RegionError::Malformed("expected `data` array".into())),
        },
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(RegionError::Malformed(format!(
                "expected array, got {}",
                json_type(other)
            )))
        }
    };

    let mut nodes = Vec::with_capacity(items.len());
    for item in items {
        let id = item.get("id").and_then(id_from);
        let name = item
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty());
        match (id, name) {
            (Some(id), Some(name)) => nodes.push(RegionNode {
                id,
                name: name.to_string(),
                parent_id: parent.cloned(),
            }),
            _ => debug!("skipping region entry without id or name"),
        }
    }
    Ok(nodes)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Region source
// ============================================================================

#[async_trait]
pub trait RegionSource: Send + Sync {
    async fn provinces(&self) -> Result<Vec<RegionNode>, RegionError>;
    async fn districts(&self, province: &RegionId) -> Result<Vec<RegionNode>, RegionError>;
    async fn wards(&self, district: &RegionId) -> Result<Vec<RegionNode>, RegionError>;
}

/// Region hierarchy API client.
pub struct RegionApi {
    client: ApiClient,
}

impl RegionApi {
    #[must_use]
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    async fn fetch(
        &self,
        path: &str,
        parent: Option<&RegionId>,
    ) -> Result<Vec<RegionNode>, RegionError> {
        let request = self.client.request(HttpMethod::Get, path)?;
        let body = self.client.send_json(request).await?;
        parse_region_list(&body, parent)
    }
}

#[async_trait]
impl RegionSource for RegionApi {
    async fn provinces(&self) -> Result<Vec<RegionNode>, RegionError> {
        self.fetch("provinces", None).await
    }

    async fn districts(&self, province: &RegionId) -> Result<Vec<RegionNode>, RegionError> {
        self.fetch(&format!("districts/{province}"), Some(province))
            .await
    }

    async fn wards(&self, district: &RegionId) -> Result<Vec<RegionNode>, RegionError> {
        self.fetch(&format!("wards/{district}"), Some(district)).await
    }
}

// ============================================================================
// Cascade state machine
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum LevelState {
    #[default]
    Empty,
    Loading,
    Loaded(Vec<RegionNode>),
    LoadError(String),
}

impl LevelState {
    #[must_use]
    pub fn options(&self) -> &[RegionNode] {
        match self {
            Self::Loaded(options) => options,
            _ => &[],
        }
    }

    fn label_for(&self, id: &RegionId) -> Option<String> {
        self.options()
            .iter()
            .find(|node| &node.id == id)
            .map(|node| node.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionChoice {
    pub id: RegionId,
    pub label: Option<String>,
}

/// The selected province, district and ward. A child is never set without its parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeSelection {
    pub province: Option<RegionChoice>,
    pub district: Option<RegionChoice>,
    pub ward: Option<RegionChoice>,
}

impl CascadeSelection {
    #[must_use]
    pub fn province_id(&self) -> Option<&RegionId> {
        self.province.as_ref().map(|c| &c.id)
    }

    #[must_use]
    pub fn district_id(&self) -> Option<&RegionId> {
        self.district.as_ref().map(|c| &c.id)
    }

    #[must_use]
    pub fn ward_id(&self) -> Option<&RegionId> {
        self.ward.as_ref().map(|c| &c.id)
    }

    /// Known labels, most specific first: ward, district, province.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        [&self.ward, &self.district, &self.province]
            .into_iter()
            .flatten()
            .filter_map(|choice| choice.label.clone())
            .filter(|label| !label.trim().is_empty())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.province.is_none()
    }
}

/// Proof that a fetch was dispatched for `level` under `parent` at `generation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub level: RegionLevel,
    pub parent: Option<RegionId>,
    generation: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeView {
    pub selection: CascadeSelection,
    pub provinces: LevelState,
    pub districts: LevelState,
    pub wards: LevelState,
}

#[derive(Debug, Default)]
pub struct CascadeState {
    levels: [LevelState; 3],
    generations: [u64; 3],
    selection: CascadeSelection,
}

impl CascadeState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn selection(&self) -> &CascadeSelection {
        &self.selection
    }

    #[must_use]
    pub fn level(&self, level: RegionLevel) -> &LevelState {
        &self.levels[level.index()]
    }

    #[must_use]
    pub fn generation(&self, level: RegionLevel) -> u64 {
        self.generations[level.index()]
    }

    #[must_use]
    pub fn view(&self) -> CascadeView {
        CascadeView {
            selection: self.selection.clone(),
            provinces: self.levels[0].clone(),
            districts: self.levels[1].clone(),
            wards: self.levels[2].clone(),
        }
    }

    fn start_load(&mut self, level: RegionLevel, parent: Option<RegionId>) -> LoadTicket {
        let i = level.index();
        self.generations[i] += 1;
        self.levels[i] = LevelState::Loading;
        LoadTicket {
            level,
            parent,
            generation: self.generations[i],
        }
    }

    /// Invalidates any in-flight fetch for `level` and clears it.
    fn reset(&mut self, level: RegionLevel) {
        let i = level.index();
        self.generations[i] += 1;
        self.levels[i] = LevelState::Empty;
        match level {
            RegionLevel::Province => self.selection.province = None,
            RegionLevel::District => self.selection.district = None,
            RegionLevel::Ward => self.selection.ward = None,
        }
    }

    pub fn begin_provinces(&mut self) -> LoadTicket {
        self.start_load(RegionLevel::Province, None)
    }

    /// Sets or clears the province. District and ward are cleared either way; a new
    /// province returns the ticket for its district fetch.
    pub fn select_province(&mut self, id: Option<RegionId>) -> Option<LoadTicket> {
        self.reset(RegionLevel::District);
        self.reset(RegionLevel::Ward);

        let Some(id) = id else {
            self.selection.province = None;
            return None;
        };
        let label = self.levels[0].label_for(&id);
        self.selection.province = Some(RegionChoice {
            id: id.clone(),
            label,
        });
        Some(self.start_load(RegionLevel::District, Some(id)))
    }

    /// Sets or clears the district under the current province; ward is cleared either way.
    pub fn select_district(
        &mut self,
        id: Option<RegionId>,
    ) -> Result<Option<LoadTicket>, RegionError> {
        if self.selection.province.is_none() {
            return Err(RegionError::ParentNotSelected(RegionLevel::Province));
        }
        self.reset(RegionLevel::Ward);
        self.selection.district = None;

        let Some(id) = id else {
            return Ok(None);
        };
        let label = self.levels[1].label_for(&id);
        self.selection.district = Some(RegionChoice {
            id: id.clone(),
            label,
        });
        Ok(Some(self.start_load(RegionLevel::Ward, Some(id))))
    }

    /// Like [`Self::select_district`], but only if `province` is still the selected one.
    pub fn select_district_under(
        &mut self,
        province: &RegionId,
        id: RegionId,
    ) -> Result<Option<LoadTicket>, RegionError> {
        if self.selection.province_id() != Some(province) {
            return Err(RegionError::Stale(RegionLevel::District));
        }
        self.select_district(Some(id))
    }

    pub fn select_ward(&mut self, id: Option<RegionId>) -> Result<(), RegionError> {
        if self.selection.district.is_none() {
            return Err(RegionError::ParentNotSelected(RegionLevel::District));
        }
        self.selection.ward = id.map(|id| {
            let label = self.levels[2].label_for(&id);
            RegionChoice { id, label }
        });
        Ok(())
    }

    /// Applies a finished fetch. Returns `Stale` without touching state when the level has
    /// moved on since the ticket was issued.
    pub fn apply(
        &mut self,
        ticket: &LoadTicket,
        result: Result<Vec<RegionNode>, RegionError>,
    ) -> Result<(), RegionError> {
        let i = ticket.level.index();
        if self.generations[i] != ticket.generation {
            debug!(
                level = %ticket.level,
                ticket = ticket.generation,
                current = self.generations[i],
                "discarding stale region options"
            );
            return Err(RegionError::Stale(ticket.level));
        }

        match result {
            Ok(options) => {
                let choice = match ticket.level {
                    RegionLevel::Province => self.selection.province.as_mut(),
                    RegionLevel::District => self.selection.district.as_mut(),
                    RegionLevel::Ward => self.selection.ward.as_mut(),
                };
                if let Some(choice) = choice.filter(|c| c.label.is_none()) {
                    choice.label = options
                        .iter()
                        .find(|n| n.id == choice.id)
                        .map(|n| n.name.clone());
                }
                self.levels[i] = LevelState::Loaded(options);
                Ok(())
            }
            Err(err) => {
                self.levels[i] = LevelState::LoadError(err.to_string());
                Err(err)
            }
        }
    }
}

// ============================================================================
// Option cache
// ============================================================================

const PROVINCES_KEY: &str = "";

struct RegionCache {
    levels: [LruCache<String, Vec<RegionNode>>; 3],
}

impl RegionCache {
    fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            levels: [LruCache::new(cap), LruCache::new(cap), LruCache::new(cap)],
        }
    }

    fn get(&mut self, level: RegionLevel, parent: &str) -> Option<Vec<RegionNode>> {
        self.levels[level.index()].get(parent).cloned()
    }

    fn put(&mut self, level: RegionLevel, parent: &str, options: Vec<RegionNode>) {
        self.levels[level.index()].put(parent.to_string(), options);
    }
}

// ============================================================================
// Async driver
// ============================================================================

pub struct RegionCascade {
    source: Arc<dyn RegionSource>,
    state: Mutex<CascadeState>,
    cache: Mutex<RegionCache>,
}

impl RegionCascade {
    pub fn new(source: Arc<dyn RegionSource>, cache_capacity: usize) -> Self {
        Self {
            source,
            state: Mutex::new(CascadeState::new()),
            cache: Mutex::new(RegionCache::new(cache_capacity)),
        }
    }

    pub async fn selection(&self) -> CascadeSelection {
        self.state.lock().await.selection().clone()
    }

    pub async fn labels(&self) -> Vec<String> {
        self.state.lock().await.selection().labels()
    }

    pub async fn view(&self) -> CascadeView {
        self.state.lock().await.view()
    }

    async fn fetch(&self, ticket: &LoadTicket) -> Result<Vec<RegionNode>, RegionError> {
        let key = ticket.parent.as_ref().map_or(PROVINCES_KEY, RegionId::as_str);
        if let Some(hit) = self.cache.lock().await.get(ticket.level, key) {
            debug!(level = %ticket.level, parent = key, "region options served from cache");
            return Ok(hit);
        }

        let result = match (ticket.level, &ticket.parent) {
            (RegionLevel::Province, _) => self.source.provinces().await,
            (RegionLevel::District, Some(parent)) => self.source.districts(parent).await,
            (RegionLevel::Ward, Some(parent)) => self.source.wards(parent).await,
            (level, None) => return Err(RegionError::ParentNotSelected(level)),
        };

        match &result {
            Ok(options) => {
                self.cache
                    .lock()
                    .await
                    .put(ticket.level, key, options.clone());
            }
            Err(err) => warn!(level = %ticket.level, parent = key, error = %err, "region load failed"),
        }
        result
    }

    async fn run(&self, ticket: LoadTicket) -> Result<(), RegionError> {
        let result = self.fetch(&ticket).await;
        self.state.lock().await.apply(&ticket, result)
    }

    #[instrument(skip(self))]
    pub async fn load_provinces(&self) -> Result<(), RegionError> {
        let ticket = self.state.lock().await.begin_provinces();
        self.run(ticket).await
    }

    /// `None` clears the province along with everything below it.
    #[instrument(skip(self))]
    pub async fn select_province(&self, id: Option<RegionId>) -> Result<(), RegionError> {
        let ticket = self.state.lock().await.select_province(id);
        match ticket {
            Some(ticket) => self.run(ticket).await,
            None => Ok(()),
        }
    }

    #[instrument(skip(self))]
    pub async fn select_district(&self, id: Option<RegionId>) -> Result<(), RegionError> {
        let ticket = self.state.lock().await.select_district(id)?;
        match ticket {
            Some(ticket) => self.run(ticket).await,
            None => Ok(()),
        }
    }

    #[instrument(skip(self))]
    pub async fn select_ward(&self, id: Option<RegionId>) -> Result<(), RegionError> {
        self.state.lock().await.select_ward(id)
    }

    /// Restores a saved selection top-down. Any user selection made while this runs wins:
    /// the hydration step that notices it returns `Stale` and stops.
    #[instrument(skip(self))]
    pub async fn hydrate(
        &self,
        province: RegionId,
        district: Option<RegionId>,
        ward: Option<RegionId>,
    ) -> Result<(), RegionError> {
        let generation_at_start = self.state.lock().await.generation(RegionLevel::District);

        if matches!(
            self.state.lock().await.level(RegionLevel::Province),
            LevelState::Empty | LevelState::LoadError(_)
        ) {
            if let Err(err) = self.load_provinces().await {
                warn!(error = %err, "province list unavailable during hydration");
            }
        }

        let ticket = {
            let mut state = self.state.lock().await;
            if state.generation(RegionLevel::District) != generation_at_start {
                return Err(RegionError::Stale(RegionLevel::Province));
            }
            state.select_province(Some(province.clone()))
        };
        if let Some(ticket) = ticket {
            self.run(ticket).await?;
        }

        let Some(district) = district else {
            return Ok(());
        };
        let ticket = self
            .state
            .lock()
            .await
            .select_district_under(&province, district.clone())?;
        if let Some(ticket) = ticket {
            self.run(ticket).await?;
        }

        if let Some(ward) = ward {
            let mut state = self.state.lock().await;
            if state.selection().district_id() != Some(&district) {
                return Err(RegionError::Stale(RegionLevel::Ward));
            }
            state.select_ward(Some(ward))?;
        }

        info!("region selection restored");
        Ok(())
    }
}

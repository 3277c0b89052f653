//! One discovery screen session.
//!
//! `DiscoverySession` owns the single current-location register and the two tier feeds.
//! Every producer (preference load, address search, GPS save, clear) writes through
//! [`resolve`], so the precedence rule lives in one place. Locks are never held across a
//! network call; ordering between overlapping operations is decided by sequence numbers
//! captured before each await.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ApiClient, Capabilities, LocationProvider};
use crate::config::DiscoveryConfig;
use crate::error::{AppError, AppResult, ErrorKind};
use crate::event::DiscoveryEvent;
use crate::geocoding::GeoResolver;
use crate::listings::{
    DiscoveryFetcher, FeedTicket, ListingQuery, RegionFilter, Tier, TierFeed, TierFeeds,
};
use crate::model::{RegionId, ResolvedLocation, UserId};
use crate::preferences::{PreferencePatch, PreferenceSync, UserPreference};
use crate::priority::{resolve, LocationChoice, PrioritySource};
use crate::regions::{CascadeView, RegionApi, RegionCascade, RegionError};

pub const EVENT_CAPACITY: usize = 64;

/// The typed text followed by any chosen region labels, joined with `", "`.
#[must_use]
pub fn compose_display_area(typed: &str, labels: &[String]) -> String {
    std::iter::once(typed.trim())
        .chain(labels.iter().map(|l| l.trim()))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum PreferenceStatus {
    #[default]
    NotLoaded,
    Loading,
    /// `None` is a user with nothing saved.
    Known(Option<UserPreference>),
    /// The load failed; nothing is known either way.
    Unknown,
}

impl PreferenceStatus {
    /// Load finished, successfully or not.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Known(_) | Self::Unknown)
    }

    #[must_use]
    pub fn known(&self) -> Option<&UserPreference> {
        match self {
            Self::Known(preference) => preference.as_ref(),
            _ => None,
        }
    }
}

/// Snapshot for the UI shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryView {
    pub user_id: Option<UserId>,
    pub preference_loaded: bool,
    pub display_area: Option<String>,
    pub priority_source: PrioritySource,
    pub location: Option<ResolvedLocation>,
    pub premium: TierFeed,
    pub standard: TierFeed,
    pub cascade: CascadeView,
    pub email_notifications: bool,
    pub geocoding_available: bool,
}

struct SessionState {
    user: Option<UserId>,
    preference: PreferenceStatus,
    explicit: Option<ResolvedLocation>,
    display_area: Option<String>,
    pending_default: Option<String>,
    email_notifications: bool,
    feeds: TierFeeds,
    session_seq: u64,
    search_seq: u64,
    location_epoch: u64,
}

impl SessionState {
    fn new(page_size: u32) -> Self {
        Self {
            user: None,
            preference: PreferenceStatus::NotLoaded,
            explicit: None,
            display_area: None,
            pending_default: None,
            email_notifications: false,
            feeds: TierFeeds::new(page_size),
            session_seq: 0,
            search_seq: 0,
            location_epoch: 0,
        }
    }

    fn choice(&self) -> LocationChoice {
        resolve(self.explicit.as_ref(), self.preference.known())
    }

    fn saved_address(&self) -> Option<String> {
        self.preference
            .known()
            .and_then(|p| p.search_address.clone())
    }
}

pub struct DiscoverySession {
    geocoder: GeoResolver,
    regions: RegionCascade,
    preferences: PreferenceSync,
    fetcher: DiscoveryFetcher,
    location: Arc<dyn LocationProvider>,
    state: RwLock<SessionState>,
    events: broadcast::Sender<DiscoveryEvent>,
    config_issue: Option<AppError>,
}

impl DiscoverySession {
    pub fn new(config: DiscoveryConfig, capabilities: Capabilities) -> AppResult<Self> {
        config.validate()?;

        let client = ApiClient::new(Arc::clone(&capabilities.http), config.api_base_url.as_str())?
            .with_timeout(config.request_timeout)
            .with_default_header("Accept", "application/json")?;

        let config_issue = config.missing_credentials().map(AppError::from);
        if let Some(issue) = &config_issue {
            warn!(code = issue.code(), "{}", issue.message);
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            geocoder: GeoResolver::new(Arc::clone(&capabilities.http), config.geocoder.clone()),
            regions: RegionCascade::new(
                Arc::new(RegionApi::new(client.clone())),
                config.region_cache_capacity,
            ),
            preferences: PreferenceSync::new(client.clone()),
            fetcher: DiscoveryFetcher::new(client),
            location: capabilities.location,
            state: RwLock::new(SessionState::new(config.default_page_size)),
            events,
            config_issue,
        })
    }

    /// Configuration problem that disables part of the pipeline (currently only geocoding).
    #[must_use]
    pub fn configuration_issue(&self) -> Option<&AppError> {
        self.config_issue.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DiscoveryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Logs and publishes a user-facing failure, returning it for the caller.
    fn fail(&self, error: impl Into<AppError>) -> AppError {
        let error = error.into();
        if error.kind.is_reportable() {
            warn!(code = error.code(), error = %error, "operation failed");
            self.emit(DiscoveryEvent::notice(error.clone()));
        } else {
            debug!(error = %error, "dropping stale result");
        }
        error
    }

    async fn require_user(&self) -> AppResult<UserId> {
        self.state
            .read()
            .await
            .user
            .clone()
            .ok_or_else(|| AppError::new(ErrorKind::Validation, "no active session"))
    }

    // ========================================================================
    // Session activation
    // ========================================================================

    /// Loads the user's preference, restores their saved region selection and fetches both
    /// tiers. Anything the user does while the load is in flight takes precedence over the
    /// loaded values.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn start(&self, user: UserId) {
        let (session, epoch) = {
            let mut st = self.state.write().await;
            st.session_seq += 1;
            st.location_epoch += 1;
            st.user = Some(user.clone());
            st.preference = PreferenceStatus::Loading;
            st.explicit = None;
            st.display_area = None;
            (st.session_seq, st.location_epoch)
        };

        let loaded = self.preferences.load(&user).await;

        let restore = {
            let mut st = self.state.write().await;
            if st.session_seq != session {
                debug!("preference load superseded by a newer session");
                return;
            }
            let untouched = st.location_epoch == epoch;

            let status = match loaded {
                Ok(preference) => {
                    self.emit(DiscoveryEvent::PreferenceLoaded {
                        found: preference.is_some(),
                    });
                    PreferenceStatus::Known(preference)
                }
                Err(err) => {
                    warn!(error = %err, "preference unknown for this session");
                    self.emit(DiscoveryEvent::PreferenceUnavailable);
                    PreferenceStatus::Unknown
                }
            };
            // a save made during the load is newer than what the load returned
            if st.preference == PreferenceStatus::Loading {
                st.preference = status;
            }
            if let Some(pref) = st.preference.known() {
                st.email_notifications = pref.email_notifications;
            }

            let pending = st.pending_default.take();
            if untouched {
                st.display_area = st.saved_address().or(pending);
                if let Some(text) = st.display_area.clone() {
                    self.emit(DiscoveryEvent::DisplayAreaChanged { text });
                }
                let choice = st.choice();
                self.emit(DiscoveryEvent::location(choice.source(), choice.location()));
            } else {
                debug!("location changed during preference load; keeping live values");
            }

            st.preference.known().filter(|_| untouched).and_then(|p| {
                p.province_id
                    .clone()
                    .map(|province| (province, p.district_id.clone(), p.ward_id.clone()))
            })
        };

        self.restore_regions(restore).await;
        self.refresh_all().await;

        match self.preferences.read_email_notification(&user).await {
            Ok(enabled) => {
                let mut st = self.state.write().await;
                if st.session_seq == session && st.email_notifications != enabled {
                    st.email_notifications = enabled;
                    self.emit(DiscoveryEvent::EmailNotificationsChanged { enabled });
                }
            }
            Err(err) => debug!(error = %err, "email notification flag not refreshed"),
        }
        info!("discovery session started");
    }

    async fn restore_regions(&self, saved: Option<(RegionId, Option<RegionId>, Option<RegionId>)>) {
        let Some((province, district, ward)) = saved else {
            if let Err(err) = self.regions.load_provinces().await {
                warn!(error = %err, "province list unavailable");
            }
            return;
        };
        if !self.regions.selection().await.is_empty() {
            debug!("region selected before preference arrived; not restoring");
            return;
        }
        match self.regions.hydrate(province, district, ward).await {
            Ok(()) => {
                let selection = self.regions.selection().await;
                self.emit(DiscoveryEvent::CascadeChanged(Box::new(selection)));
            }
            Err(err) if err.is_stale() => debug!("region restore overtaken by user selection"),
            Err(err) => warn!(error = %err, "saved region selection only partly restored"),
        }
    }

    /// A display value supplied by the host (for example a last-known city). Held back until
    /// the preference load settles, and never replaces a saved or searched location.
    pub async fn offer_default_location(&self, text: impl Into<String>) {
        let text = text.into();
        let mut st = self.state.write().await;
        if !st.preference.is_settled() {
            debug!("default location deferred until preference load completes");
            st.pending_default = Some(text);
            return;
        }
        if st.display_area.is_none() {
            st.display_area = Some(text.clone());
            self.emit(DiscoveryEvent::DisplayAreaChanged { text });
        }
    }

    // ========================================================================
    // Location producers
    // ========================================================================

    /// Forward-geocodes `typed`, makes it the explicit location, and resets both tiers. The
    /// location is saved for next session on a best-effort basis.
    #[instrument(skip(self, typed))]
    pub async fn search_address(&self, typed: &str) -> AppResult<ResolvedLocation> {
        let seq = {
            let mut st = self.state.write().await;
            st.search_seq += 1;
            st.search_seq
        };

        let resolved = self.geocoder.geocode(typed).await.map_err(|e| self.fail(e))?;
        let labels = self.regions.labels().await;
        let display = compose_display_area(typed, &labels);

        let user = {
            let mut st = self.state.write().await;
            if st.search_seq != seq {
                return Err(self.fail(AppError::new(
                    ErrorKind::StaleResult,
                    "search superseded by a newer one",
                )));
            }
            st.explicit = Some(resolved.clone());
            st.location_epoch += 1;
            st.display_area = Some(display.clone());
            self.emit(DiscoveryEvent::location(
                PrioritySource::ExplicitSearch,
                Some(&resolved),
            ));
            self.emit(DiscoveryEvent::DisplayAreaChanged {
                text: display.clone(),
            });
            st.user.clone()
        };

        let persist = async {
            if let Some(user) = &user {
                let mut patch = PreferencePatch::location(&resolved)
                    .with_regions(&self.regions.selection().await);
                patch.search_address = Some(display.clone());
                self.persist(user, &patch).await.ok();
            }
        };
        tokio::join!(self.refresh_all(), persist);
        Ok(resolved)
    }

    /// GPS fix → reverse geocode → save as the user's preference → refetch both tiers.
    ///
    /// The save always lands, but a location chosen while it was in flight stays in charge
    /// of the display and the results.
    #[instrument(skip(self))]
    pub async fn save_current_location(&self) -> AppResult<ResolvedLocation> {
        let user = self.require_user().await?;
        let (epoch, search) = {
            let st = self.state.read().await;
            (st.location_epoch, st.search_seq)
        };
        let point = self
            .location
            .current_position()
            .await
            .map_err(|e| self.fail(e))?;
        let resolved = self
            .geocoder
            .reverse_geocode(point)
            .await
            .map_err(|e| self.fail(e))?;

        let patch = PreferencePatch::location(&resolved);
        self.persist(&user, &patch).await.map_err(|e| self.fail(e))?;

        let refresh = {
            let mut st = self.state.write().await;
            if st.location_epoch == epoch {
                // searches started before this save are older than it
                if st.search_seq == search {
                    st.search_seq += 1;
                }
                st.location_epoch += 1;
                st.explicit = None;
                st.display_area = Some(resolved.formatted_address.clone());
                let choice = st.choice();
                self.emit(DiscoveryEvent::location(choice.source(), choice.location()));
                self.emit(DiscoveryEvent::DisplayAreaChanged {
                    text: resolved.formatted_address.clone(),
                });
                true
            } else {
                debug!("location changed while saving; keeping the newer choice");
                st.explicit.is_none()
            }
        };
        if refresh {
            self.refresh_all().await;
        }
        Ok(resolved)
    }

    /// Saves `patch` and folds it into the session's copy of the preference.
    async fn persist(&self, user: &UserId, patch: &PreferencePatch) -> AppResult<()> {
        match self.preferences.save(user, patch).await {
            Ok(_) => {
                let mut st = self.state.write().await;
                if st.user.as_ref() == Some(user) {
                    let mut merged = st.preference.known().cloned().unwrap_or_default();
                    merged.user_id.get_or_insert_with(|| user.clone());
                    patch.apply_to(&mut merged);
                    st.preference = PreferenceStatus::Known(Some(merged));
                }
                self.emit(DiscoveryEvent::PreferenceSaved);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "preference save failed");
                Err(err.into())
            }
        }
    }

    /// Drops the searched location; the saved preference (if any) drives results again.
    #[instrument(skip(self))]
    pub async fn clear_search(&self) {
        {
            let mut st = self.state.write().await;
            st.search_seq += 1;
            st.location_epoch += 1;
            st.explicit = None;
            st.display_area = st.saved_address();
            let choice = st.choice();
            self.emit(DiscoveryEvent::location(choice.source(), choice.location()));
        }
        self.refresh_all().await;
    }

    // ========================================================================
    // Region cascade
    // ========================================================================

    pub async fn select_province(&self, id: Option<RegionId>) -> AppResult<()> {
        let result = self.regions.select_province(id).await;
        self.after_cascade(result).await
    }

    pub async fn select_district(&self, id: Option<RegionId>) -> AppResult<()> {
        let result = self.regions.select_district(id).await;
        self.after_cascade(result).await
    }

    pub async fn select_ward(&self, id: Option<RegionId>) -> AppResult<()> {
        let result = self.regions.select_ward(id).await;
        self.after_cascade(result).await
    }

    async fn after_cascade(&self, result: Result<(), RegionError>) -> AppResult<()> {
        let outcome = match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_stale() => {
                debug!(error = %err, "cascade result superseded");
                return Ok(());
            }
            Err(err @ RegionError::ParentNotSelected(_)) => return Err(self.fail(err)),
            Err(err) => Err(self.fail(err)),
        };
        let selection = self.regions.selection().await;
        self.emit(DiscoveryEvent::CascadeChanged(Box::new(selection)));
        self.refresh_all().await;
        outcome
    }

    // ========================================================================
    // Listings
    // ========================================================================

    async fn query_for(&self, ticket: &FeedTicket) -> ListingQuery {
        let regions = RegionFilter::from(&self.regions.selection().await);
        let st = self.state.read().await;
        ListingQuery::new(ticket.tier, ticket.page, st.feeds.page_size())
            .with_user(st.user.clone())
            .with_point(st.choice().point())
            .with_regions(regions)
    }

    async fn load_page(&self, ticket: FeedTicket, query: ListingQuery) -> bool {
        let result = self.fetcher.fetch_tier(&query).await;
        let failure = result.as_ref().err().cloned();

        let mut st = self.state.write().await;
        if !st.feeds.apply(&ticket, result) {
            return false;
        }
        match failure {
            Some(err) => {
                self.fail(err);
            }
            None => {
                let page = &st.feeds.feed(ticket.tier).page;
                self.emit(DiscoveryEvent::TierUpdated {
                    tier: ticket.tier,
                    page_number: page.page_number,
                    total_pages: page.total_pages,
                });
            }
        }
        true
    }

    /// Both tiers back to page 0 for the current location and filters.
    pub async fn refresh_all(&self) {
        let [premium, standard] = self.state.write().await.feeds.reset_all();
        let premium_query = self.query_for(&premium).await;
        let standard_query = self.query_for(&standard).await;
        tokio::join!(
            self.load_page(premium, premium_query),
            self.load_page(standard, standard_query)
        );
    }

    /// Advances one tier. Returns `false` when there is no next page or a fetch is running.
    #[instrument(skip(self))]
    pub async fn next_page(&self, tier: Tier) -> bool {
        let Some(ticket) = self.state.write().await.feeds.begin_next(tier) else {
            return false;
        };
        let query = self.query_for(&ticket).await;
        self.load_page(ticket, query).await
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Optimistic: the flag flips immediately and rolls back if the write fails.
    #[instrument(skip(self))]
    pub async fn set_email_notifications(&self, enabled: bool) -> AppResult<bool> {
        let user = self.require_user().await?;
        let previous = {
            let mut st = self.state.write().await;
            std::mem::replace(&mut st.email_notifications, enabled)
        };
        self.emit(DiscoveryEvent::EmailNotificationsChanged { enabled });

        let result = self
            .preferences
            .write_email_notification(&user, enabled)
            .await;

        let mut st = self.state.write().await;
        match result {
            Ok(stored) => {
                st.email_notifications = stored;
                if stored != enabled {
                    self.emit(DiscoveryEvent::EmailNotificationsChanged { enabled: stored });
                }
                Ok(stored)
            }
            Err(err) => {
                st.email_notifications = previous;
                self.emit(DiscoveryEvent::EmailNotificationsChanged { enabled: previous });
                Err(self.fail(err))
            }
        }
    }

    // ========================================================================
    // View
    // ========================================================================

    pub async fn view(&self) -> DiscoveryView {
        let cascade = self.regions.view().await;
        let st = self.state.read().await;
        let choice = st.choice();
        DiscoveryView {
            user_id: st.user.clone(),
            preference_loaded: st.preference.is_settled(),
            display_area: st.display_area.clone(),
            priority_source: choice.source(),
            location: choice.location().cloned(),
            premium: st.feeds.feed(Tier::Premium).clone(),
            standard: st.feeds.feed(Tier::Standard).clone(),
            cascade,
            email_notifications: st.email_notifications,
            geocoding_available: self.geocoder.is_configured(),
        }
    }
}

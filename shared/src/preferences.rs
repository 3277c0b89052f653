//! Saved search preference: load once per session activation, partial saves serialized per
//! user, and the email-notification flag with lenient boolean decoding.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ApiClient, HttpError, HttpMethod};
use crate::error::{AppError, ErrorKind};
use crate::model::{GeoPoint, RegionId, ResolvedLocation, UserId};
use crate::regions::CascadeSelection;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreferenceError {
    #[error("preference request failed: {0}")]
    Http(#[from] HttpError),

    #[error("malformed preference response: {0}")]
    Malformed(String),

    #[error("nothing to save")]
    EmptyPatch,
}

impl PreferenceError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(e) => e.kind(),
            Self::Malformed(_) => ErrorKind::Deserialization,
            Self::EmptyPatch => ErrorKind::Validation,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_retryable())
    }
}

impl From<PreferenceError> for AppError {
    fn from(e: PreferenceError) -> Self {
        let error = AppError::new(e.kind(), e.to_string());
        match &e {
            PreferenceError::Http(http) => http.annotate(error),
            _ => error,
        }
    }
}

// ============================================================================
// Lenient decoding
// ============================================================================

/// Canonical boolean for a provider value. `true`, `1`, and the strings `"1"`, `"true"`,
/// `"yes"`, `"on"` (trimmed, any case) are true; everything else is false.
#[must_use]
pub fn normalize_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Value::Null | Value::Array(_) | Value::Object(_) => false,
    }
}

/// Email flag from any of: a bare value, `{enabled}`, `{emailNotifications}`, `{data: ...}`.
#[must_use]
pub fn extract_email_flag(body: &Value) -> bool {
    match body {
        Value::Object(map) => {
            if let Some(inner) = map.get("data") {
                return extract_email_flag(inner);
            }
            map.get("enabled")
                .or_else(|| map.get("emailNotifications"))
                .map_or(false, normalize_bool)
        }
        other => normalize_bool(other),
    }
}

fn lenient_flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    Ok(normalize_bool(&Value::deserialize(de)?))
}

fn lenient_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<RegionId>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) if !s.trim().is_empty() => Some(RegionId::new(s.trim())),
        Value::Number(n) => Some(RegionId::new(n.to_string())),
        _ => None,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite()))
}

fn lenient_text<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

// ============================================================================
// Types
// ============================================================================

/// Server-side preference. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreference {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub province_id: Option<RegionId>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub district_id: Option<RegionId>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub ward_id: Option<RegionId>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub search_address: Option<String>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub email_notifications: bool,
}

impl UserPreference {
    /// Saved coordinates, only when both are present and valid.
    #[must_use]
    pub fn point(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => GeoPoint::new(lat, lng).ok(),
            _ => None,
        }
    }
}

/// Fields the client intends to change. Absent fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub province_id: Option<RegionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub district_id: Option<RegionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ward_id: Option<RegionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_address: Option<String>,
}

impl PreferencePatch {
    /// Coordinates and address of a resolved location.
    #[must_use]
    pub fn location(location: &ResolvedLocation) -> Self {
        Self {
            latitude: Some(location.point.lat()),
            longitude: Some(location.point.lng()),
            search_address: Some(location.formatted_address.clone()),
            ..Self::default()
        }
    }

    /// Adds whichever cascade levels are selected.
    #[must_use]
    pub fn with_regions(mut self, selection: &CascadeSelection) -> Self {
        self.province_id = selection.province_id().cloned();
        self.district_id = selection.district_id().cloned();
        self.ward_id = selection.ward_id().cloned();
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Local merge, used when the server answers a save without a body.
    pub fn apply_to(&self, preference: &mut UserPreference) {
        if let Some(v) = &self.province_id {
            preference.province_id = Some(v.clone());
        }
        if let Some(v) = &self.district_id {
            preference.district_id = Some(v.clone());
        }
        if let Some(v) = &self.ward_id {
            preference.ward_id = Some(v.clone());
        }
        if let Some(v) = self.latitude {
            preference.latitude = Some(v);
        }
        if let Some(v) = self.longitude {
            preference.longitude = Some(v);
        }
        if let Some(v) = &self.search_address {
            preference.search_address = Some(v.clone());
        }
    }
}

fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// `None` for a known-empty preference (`null` or `{}`).
fn parse_preference(body: Value, user: &UserId) -> Result<Option<UserPreference>, PreferenceError> {
    let body = unwrap_data(body);
    match &body {
        Value::Null => return Ok(None),
        Value::Object(map) if map.is_empty() => return Ok(None),
        Value::Object(_) => {}
        _ => return Err(PreferenceError::Malformed("expected an object".into())),
    }
    let mut preference: UserPreference =
        serde_json::from_value(body).map_err(|e| PreferenceError::Malformed(e.to_string()))?;
    preference.user_id.get_or_insert_with(|| user.clone());
    Ok(Some(preference))
}

// ============================================================================
// Sync service
// ============================================================================

pub struct PreferenceSync {
    client: ApiClient,
    write_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl PreferenceSync {
    #[must_use]
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn write_lock(&self, user: &UserId) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        Arc::clone(locks.entry(user.clone()).or_default())
    }

    /// `Ok(None)` is a known-empty preference (404, `null` or `{}`); `Err` means unknown.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn load(&self, user: &UserId) -> Result<Option<UserPreference>, PreferenceError> {
        let request = self
            .client
            .request(HttpMethod::Get, &format!("profile/{user}/preferences"))?;

        match self.client.send_json(request).await {
            Ok(body) => {
                let preference = parse_preference(body, user)?;
                info!(found = preference.is_some(), "preference loaded");
                Ok(preference)
            }
            Err(HttpError::HttpStatus { status: 404, .. }) => {
                debug!("no preference saved yet");
                Ok(None)
            }
            Err(err) => {
                warn!(error = %err, "preference load failed");
                Err(err.into())
            }
        }
    }

    /// Partial update. Saves for the same user run one at a time in call order.
    #[instrument(skip(self, patch), fields(user = %user))]
    pub async fn save(
        &self,
        user: &UserId,
        patch: &PreferencePatch,
    ) -> Result<UserPreference, PreferenceError> {
        if patch.is_empty() {
            return Err(PreferenceError::EmptyPatch);
        }
        let request = self
            .client
            .request(HttpMethod::Post, &format!("profile/{user}/preferences"))?
            .with_json(patch)?;

        let lock = self.write_lock(user).await;
        let _guard = lock.lock().await;

        let body = self.client.send_json(request).await?;
        let saved = match parse_preference(body, user) {
            Ok(Some(preference)) => preference,
            Ok(None) | Err(PreferenceError::Malformed(_)) => {
                let mut preference = UserPreference {
                    user_id: Some(user.clone()),
                    ..UserPreference::default()
                };
                patch.apply_to(&mut preference);
                preference
            }
            Err(err) => return Err(err),
        };
        info!("preference saved");
        Ok(saved)
    }

    #[instrument(skip(self), fields(user = %user))]
    pub async fn read_email_notification(&self, user: &UserId) -> Result<bool, PreferenceError> {
        let request = self
            .client
            .request(HttpMethod::Get, "profile/email-notifications")?
            .with_query("userId", user.as_str())?;
        let body = self.client.send_json(request).await?;
        Ok(extract_email_flag(&body))
    }

    /// Returns the server's value when it echoes one, otherwise `enabled`.
    #[instrument(skip(self), fields(user = %user))]
    pub async fn write_email_notification(
        &self,
        user: &UserId,
        enabled: bool,
    ) -> Result<bool, PreferenceError> {
        let request = self
            .client
            .request(
                HttpMethod::Patch,
                &format!("profile/{user}/email-notifications"),
            )?
            .with_json(&json!({ "enabled": enabled }))?;

        let lock = self.write_lock(user).await;
        let _guard = lock.lock().await;

        let body = self.client.send_json(request).await?;
        let stored = match &body {
            Value::Null => enabled,
            Value::Object(map) if map.is_empty() => enabled,
            other => extract_email_flag(other),
        };
        info!(enabled = stored, "email notification preference updated");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::ScriptedTransport;
    use crate::capabilities::{HttpRequest, HttpResponse};
    use crate::model::LocationSource;
    use proptest::prelude::*;

    fn sync(transport: &Arc<ScriptedTransport>) -> Arc<PreferenceSync> {
        let client = ApiClient::new(transport.clone(), "https://api.example.com/api").unwrap();
        Arc::new(PreferenceSync::new(client))
    }

    fn user() -> UserId {
        UserId::new("u-42")
    }

    #[test]
    fn test_normalize_bool_truthy_and_falsy() {
        for truthy in [json!(true), json!(1), json!("1"), json!("true"), json!("Yes"), json!("ON")] {
            assert!(normalize_bool(&truthy), "{truthy} should be true");
        }
        for falsy in [
            json!(false),
            json!(0),
            json!("0"),
            json!("no"),
            Value::Null,
            json!("garbage"),
            json!(2),
            json!([true]),
        ] {
            assert!(!normalize_bool(&falsy), "{falsy} should be false");
        }
    }

    #[test]
    fn test_extract_email_flag_shapes() {
        assert!(extract_email_flag(&json!(true)));
        assert!(extract_email_flag(&json!({"enabled": "yes"})));
        assert!(extract_email_flag(&json!({"emailNotifications": 1})));
        assert!(extract_email_flag(&json!({"data": {"enabled": " on "}})));
        assert!(!extract_email_flag(&json!({"data": null})));
        assert!(!extract_email_flag(&json!({})));
    }

    proptest! {
        #[test]
        fn prop_truthy_words_any_case_and_padding(
            word in prop_oneof![Just("true"), Just("yes"), Just("on"), Just("1")],
            upper in proptest::collection::vec(any::<bool>(), 4),
            left in "[ \t]{0,3}",
            right in "[ \t]{0,3}",
        ) {
            let cased: String = word
                .chars()
                .zip(upper.iter().cycle())
                .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c })
                .collect();
            let input = format!("{left}{cased}{right}");
            prop_assert!(normalize_bool(&Value::String(input)));
        }

        #[test]
        fn prop_unrecognized_strings_are_false(s in "\\PC{0,12}") {
            let word = s.trim().to_ascii_lowercase();
            prop_assume!(!matches!(word.as_str(), "1" | "true" | "yes" | "on"));
            prop_assert!(!normalize_bool(&Value::String(s)));
        }

        #[test]
        fn prop_numbers_other_than_one_are_false(n in any::<i64>()) {
            prop_assume!(n != 1);
            prop_assert!(!normalize_bool(&json!(n)));
        }
    }

    #[test]
    fn test_preference_tolerates_loose_wire_types() {
        let body = json!({
            "provinceId": 79,
            "districtId": "760",
            "wardId": null,
            "latitude": "10.776",
            "longitude": 106.7,
            "searchAddress": "",
            "emailNotifications": "1"
        });
        let pref = parse_preference(body, &user()).unwrap().unwrap();
        assert_eq!(pref.user_id, Some(user()));
        assert_eq!(pref.province_id, Some(RegionId::new("79")));
        assert_eq!(pref.ward_id, None);
        assert_eq!(pref.search_address, None);
        assert!(pref.email_notifications);
        assert_eq!(pref.point(), Some(GeoPoint::new(10.776, 106.7).unwrap()));
    }

    #[test]
    fn test_point_requires_both_coordinates() {
        let pref = UserPreference {
            latitude: Some(10.0),
            ..UserPreference::default()
        };
        assert_eq!(pref.point(), None);
        let pref = UserPreference {
            latitude: Some(95.0),
            longitude: Some(10.0),
            ..UserPreference::default()
        };
        assert_eq!(pref.point(), None);
    }

    #[test]
    fn test_patch_serializes_only_set_fields() {
        let location = ResolvedLocation::new(
            GeoPoint::new(10.776, 106.7).unwrap(),
            "Nguyễn Huệ, Quận 1",
            LocationSource::DeviceGps,
        );
        let patch = PreferencePatch::location(&location);
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            value,
            json!({"latitude": 10.776, "longitude": 106.7, "searchAddress": "Nguyễn Huệ, Quận 1"})
        );
        assert!(value.get("emailNotifications").is_none());
        assert!(PreferencePatch::default().is_empty());
    }

    #[tokio::test]
    async fn test_load_distinguishes_empty_from_unknown() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(HttpMethod::Get, "/preferences", 404, json!({}));
        transport.reply_json(HttpMethod::Get, "/preferences", 200, Value::Null);
        transport.reply_json(HttpMethod::Get, "/preferences", 200, json!({}));
        transport.reply_json(HttpMethod::Get, "/preferences", 500, json!({}));
        transport.reply_json(
            HttpMethod::Get,
            "/preferences",
            200,
            json!({"data": {"provinceId": "79"}}),
        );
        let sync = sync(&transport);

        assert_eq!(sync.load(&user()).await.unwrap(), None);
        assert_eq!(sync.load(&user()).await.unwrap(), None);
        assert_eq!(sync.load(&user()).await.unwrap(), None);
        assert!(sync.load(&user()).await.unwrap_err().is_retryable());
        let found = sync.load(&user()).await.unwrap().unwrap();
        assert_eq!(found.province_id, Some(RegionId::new("79")));

        assert!(transport.requests()[0]
            .path()
            .ends_with("/api/profile/u-42/preferences"));
    }

    #[tokio::test]
    async fn test_save_posts_patch_and_falls_back_to_local_merge() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_raw(HttpMethod::Post, "/preferences", 200, Vec::new());
        let sync = sync(&transport);

        let patch = PreferencePatch {
            search_address: Some("123 Le Loi".into()),
            ..PreferencePatch::default()
        };
        let saved = sync.save(&user(), &patch).await.unwrap();
        assert_eq!(saved.search_address.as_deref(), Some("123 Le Loi"));
        assert_eq!(saved.user_id, Some(user()));

        let sent = transport.requests();
        assert_eq!(sent[0].json_body(), Some(json!({"searchAddress": "123 Le Loi"})));
    }

    #[tokio::test]
    async fn test_empty_patch_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        let sync = sync(&transport);
        assert_eq!(
            sync.save(&user(), &PreferencePatch::default()).await.unwrap_err(),
            PreferenceError::EmptyPatch
        );
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_saves_for_same_user_are_serialized() {
        let transport = Arc::new(ScriptedTransport::new());
        let gate = transport.reply_gated(HttpMethod::Post, "/preferences");
        transport.reply_json(
            HttpMethod::Post,
            "/preferences",
            200,
            json!({"searchAddress": "second"}),
        );
        let sync = sync(&transport);

        let first = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                let patch = PreferencePatch {
                    search_address: Some("first".into()),
                    ..PreferencePatch::default()
                };
                sync.save(&user(), &patch).await
            })
        };
        while transport.count(HttpMethod::Post, "/preferences") == 0 {
            tokio::task::yield_now().await;
        }

        let second = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                let patch = PreferencePatch {
                    search_address: Some("second".into()),
                    ..PreferencePatch::default()
                };
                sync.save(&user(), &patch).await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.count(HttpMethod::Post, "/preferences"), 1);

        let body = serde_json::to_vec(&json!({"searchAddress": "first"})).unwrap();
        gate.send(Ok(HttpResponse::new(200, body, "gated".into(), 0)))
            .ok();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.search_address.as_deref(), Some("first"));
        assert_eq!(second.search_address.as_deref(), Some("second"));

        let bodies: Vec<_> = transport
            .requests()
            .iter()
            .filter_map(HttpRequest::json_body)
            .collect();
        assert_eq!(
            bodies,
            vec![json!({"searchAddress": "first"}), json!({"searchAddress": "second"})]
        );
    }

    #[tokio::test]
    async fn test_email_notification_read_and_write() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(
            HttpMethod::Get,
            "/email-notifications",
            200,
            json!({"data": {"emailNotifications": "true"}}),
        );
        transport.reply_raw(HttpMethod::Patch, "/email-notifications", 204, Vec::new());
        let sync = sync(&transport);

        assert!(sync.read_email_notification(&user()).await.unwrap());
        assert!(!sync.write_email_notification(&user(), false).await.unwrap());

        let sent = transport.requests();
        assert_eq!(sent[0].query_param("userId").as_deref(), Some("u-42"));
        assert!(sent[1].path().ends_with("/profile/u-42/email-notifications"));
        assert_eq!(sent[1].json_body(), Some(json!({"enabled": false})));
    }

    #[tokio::test]
    async fn test_email_read_failure_propagates() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(HttpMethod::Get, "/email-notifications", 503, json!({}));
        let sync = sync(&transport);
        let err = sync.read_email_notification(&user()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderError);
    }
}

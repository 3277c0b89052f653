//! Forward and reverse geocoding against the external provider.
//!
//! Forward lookups are user-triggered and make a single attempt. Reverse lookups retry
//! transient failures (5xx, network, timeout) with exponential backoff, bounded by the
//! configured attempt count. 4xx, malformed bodies and empty results fail immediately.

use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{execute_with_timeout, HttpError, HttpRequest, HttpTransport};
use crate::config::GeocoderConfig;
use crate::error::{AppError, ErrorKind, GEOCODING_SERVICE, SERVICE_KEY};
use crate::model::{GeoPoint, LocationSource, ResolvedLocation};

const GEOCODE_PATH: &str = "Geocode";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeocodeError {
    #[error("geocoding API key is not configured")]
    MissingCredential,

    #[error("no result for the requested location")]
    NotFound,

    #[error("geocoding timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("geocoding provider error: {message}")]
    ProviderError { status: Option<u16>, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl GeocodeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCredential => ErrorKind::MissingCredential,
            Self::NotFound => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ProviderError { .. } => ErrorKind::ProviderError,
            Self::Network(_) => ErrorKind::Network,
            Self::InvalidInput(_) => ErrorKind::Validation,
        }
    }

    /// Only transport-level failures and 5xx are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network(_) => true,
            Self::ProviderError { status, .. } => status.map_or(false, |s| (500..600).contains(&s)),
            Self::MissingCredential | Self::NotFound | Self::InvalidInput(_) => false,
        }
    }

    fn from_http(err: HttpError) -> Self {
        match err {
            HttpError::Timeout { .. } => Self::Timeout { attempts: 1 },
            HttpError::Connection { host, message } => Self::Network(format!("{host}: {message}")),
            HttpError::HttpStatus {
                status, message, ..
            } => Self::ProviderError {
                status: Some(status),
                message,
            },
            other => Self::ProviderError {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<GeocodeError> for AppError {
    fn from(e: GeocodeError) -> Self {
        AppError::new(e.kind(), e.to_string()).with_context(SERVICE_KEY, GEOCODING_SERVICE)
    }
}

// ============================================================================
// Provider wire format
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    results: Option<Vec<ProviderResult>>,
}

#[derive(Debug, Deserialize)]
struct ProviderResult {
    #[serde(default)]
    geometry: Option<ProviderGeometry>,
    #[serde(default)]
    formatted_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderGeometry {
    location: ProviderLatLng,
}

#[derive(Debug, Deserialize)]
struct ProviderLatLng {
    lat: f64,
    lng: f64,
}

/// First result of a provider body, or `NotFound` when `results` is absent or empty.
fn first_result(body: &[u8]) -> Result<ProviderResult, GeocodeError> {
    let parsed: ProviderResponse =
        serde_json::from_slice(body).map_err(|e| GeocodeError::ProviderError {
            status: None,
            message: format!("malformed geocoding response: {e}"),
        })?;

    parsed
        .results
        .and_then(|results| results.into_iter().next())
        .ok_or(GeocodeError::NotFound)
}

/// Delay before retry number `attempt` (1-based): `base * 2^attempt`.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

// ============================================================================
// Resolver
// ============================================================================

pub struct GeoResolver {
    transport: Arc<dyn HttpTransport>,
    config: GeocoderConfig,
    credential_reported: AtomicBool,
}

impl GeoResolver {
    pub fn new(transport: Arc<dyn HttpTransport>, config: GeocoderConfig) -> Self {
        Self {
            transport,
            config,
            credential_reported: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.api_key().is_some()
    }

    fn api_key(&self) -> Result<&str, GeocodeError> {
        match self.config.api_key() {
            Some(key) => Ok(key),
            None => {
                if !self.credential_reported.swap(true, Ordering::Relaxed) {
                    error!("geocoding API key missing; address lookup disabled");
                }
                Err(GeocodeError::MissingCredential)
            }
        }
    }

    fn build_request(
        &self,
        param: &str,
        value: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<HttpRequest, GeocodeError> {
        let url = format!(
            "{}/{GEOCODE_PATH}",
            self.config.base_url.trim_end_matches('/')
        );
        HttpRequest::get(url)
            .and_then(|r| r.with_query(param, value))
            .and_then(|r| r.with_query("api_key", api_key))
            .and_then(|r| r.with_timeout(timeout))
            .map_err(|e| GeocodeError::ProviderError {
                status: None,
                message: e.to_string(),
            })
    }

    async fn call(&self, request: HttpRequest) -> Result<ProviderResult, GeocodeError> {
        let response = execute_with_timeout(self.transport.as_ref(), request)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(GeocodeError::from_http)?;
        first_result(response.body())
    }

    /// Forward lookup of free text. Single attempt.
    #[instrument(skip(self, address), fields(len = address.len()))]
    pub async fn geocode(&self, address: &str) -> Result<ResolvedLocation, GeocodeError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(GeocodeError::InvalidInput("address cannot be empty".into()));
        }
        let api_key = self.api_key()?;
        let request =
            self.build_request("address", address, api_key, self.config.forward_timeout)?;

        let result = self.call(request).await.map_err(|e| {
            warn!(error = %e, "forward geocode failed");
            e
        })?;

        let location = result
            .geometry
            .ok_or_else(|| GeocodeError::ProviderError {
                status: None,
                message: "result has no geometry".into(),
            })?
            .location;
        let point = GeoPoint::new(location.lat, location.lng).map_err(|e| {
            GeocodeError::ProviderError {
                status: None,
                message: e.to_string(),
            }
        })?;
        let formatted_address = result
            .formatted_address
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| address.to_string());

        info!(lat = point.lat(), lng = point.lng(), "address geocoded");
        Ok(ResolvedLocation::new(
            point,
            formatted_address,
            LocationSource::ExplicitSearch,
        ))
    }

    /// Reverse lookup with the configured attempt bound.
    pub async fn reverse_geocode(&self, point: GeoPoint) -> Result<ResolvedLocation, GeocodeError> {
        self.reverse_geocode_with_attempts(point, self.config.reverse_max_attempts)
            .await
    }

    /// The returned point is always the requested one, never the provider's snapped value.
    #[instrument(skip(self, point), fields(lat = point.lat(), lng = point.lng()))]
    pub async fn reverse_geocode_with_attempts(
        &self,
        point: GeoPoint,
        max_attempts: u32,
    ) -> Result<ResolvedLocation, GeocodeError> {
        let api_key = self.api_key()?;
        let max_attempts = max_attempts.max(1);
        let latlng = point.to_query_value();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request =
                self.build_request("latlng", &latlng, api_key, self.config.reverse_timeout)?;

            match self.call(request).await {
                Ok(result) => {
                    let formatted_address = result
                        .formatted_address
                        .filter(|a| !a.trim().is_empty())
                        .ok_or(GeocodeError::NotFound)?;
                    info!(attempt, "reverse geocode resolved");
                    return Ok(ResolvedLocation::new(
                        point,
                        formatted_address,
                        LocationSource::DeviceGps,
                    ));
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = backoff_delay(self.config.backoff_base, attempt);
                    warn!(
                        error = %err,
                        attempt,
                        max_attempts,
                        "reverse geocode failed; retrying after {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(GeocodeError::Timeout { .. }) => {
                    warn!(attempt, "reverse geocode timed out; giving up");
                    return Err(GeocodeError::Timeout { attempts: attempt });
                }
                Err(err) => {
                    debug!(error = %err, attempt, "reverse geocode failed without retry");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::ScriptedTransport;
    use crate::capabilities::HttpMethod;
    use secrecy::SecretString;
    use serde_json::json;
    use tokio::time::Instant;

    fn config(key: Option<&str>) -> GeocoderConfig {
        GeocoderConfig {
            base_url: "https://geo.example.com".into(),
            api_key: key.map(|k| SecretString::new(k.to_string())),
            ..GeocoderConfig::default()
        }
    }

    fn resolver(transport: &Arc<ScriptedTransport>, key: Option<&str>) -> GeoResolver {
        GeoResolver::new(transport.clone(), config(key))
    }

    fn hit(address: &str, lat: f64, lng: f64) -> serde_json::Value {
        json!({
            "results": [{
                "geometry": {"location": {"lat": lat, "lng": lng}},
                "formatted_address": address
            }]
        })
    }

    fn saigon() -> GeoPoint {
        GeoPoint::new(10.776, 106.700).unwrap()
    }

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
    }

    #[test]
    fn test_first_result_absent_and_empty_are_not_found() {
        assert_eq!(first_result(br#"{}"#).unwrap_err(), GeocodeError::NotFound);
        assert_eq!(
            first_result(br#"{"results": []}"#).unwrap_err(),
            GeocodeError::NotFound
        );
        assert!(matches!(
            first_result(b"<html>").unwrap_err(),
            GeocodeError::ProviderError { status: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_geocode_missing_credential_reported_without_request() {
        let transport = Arc::new(ScriptedTransport::new());
        let resolver = resolver(&transport, None);

        assert_eq!(
            resolver.geocode("123 Le Loi").await.unwrap_err(),
            GeocodeError::MissingCredential
        );
        assert_eq!(
            resolver.reverse_geocode(saigon()).await.unwrap_err(),
            GeocodeError::MissingCredential
        );
        assert!(transport.requests().is_empty());
        assert!(!resolver.is_configured());
    }

    #[tokio::test]
    async fn test_geocode_success_uses_provider_point() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(
            HttpMethod::Get,
            "/Geocode",
            200,
            hit("123 Lê Lợi, Bến Thành, Quận 1", 10.7731, 106.7004),
        );
        let resolver = resolver(&transport, Some("key-1"));

        let resolved = resolver.geocode("  123 Le Loi ").await.unwrap();
        assert_eq!(resolved.point, GeoPoint::new(10.7731, 106.7004).unwrap());
        assert_eq!(resolved.formatted_address, "123 Lê Lợi, Bến Thành, Quận 1");
        assert_eq!(resolved.source, LocationSource::ExplicitSearch);

        let sent = transport.requests();
        assert_eq!(sent[0].query_param("address").as_deref(), Some("123 Le Loi"));
        assert_eq!(sent[0].query_param("api_key").as_deref(), Some("key-1"));
    }

    #[tokio::test]
    async fn test_geocode_does_not_retry_on_server_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(HttpMethod::Get, "/Geocode", 503, json!({}));
        transport.reply_json(HttpMethod::Get, "/Geocode", 200, hit("x", 1.0, 1.0));
        let resolver = resolver(&transport, Some("key"));

        let err = resolver.geocode("somewhere").await.unwrap_err();
        assert!(matches!(err, GeocodeError::ProviderError { status: Some(503), .. }));
        assert_eq!(transport.count(HttpMethod::Get, "/Geocode"), 1);
    }

    #[tokio::test]
    async fn test_geocode_empty_results_not_found() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(HttpMethod::Get, "/Geocode", 200, json!({"results": []}));
        let resolver = resolver(&transport, Some("key"));
        assert_eq!(
            resolver.geocode("nowhere").await.unwrap_err(),
            GeocodeError::NotFound
        );
    }

    #[tokio::test]
    async fn test_geocode_rejects_blank_input() {
        let transport = Arc::new(ScriptedTransport::new());
        let resolver = resolver(&transport, Some("key"));
        assert!(matches!(
            resolver.geocode("   ").await,
            Err(GeocodeError::InvalidInput(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_geocode_retries_server_errors_with_backoff() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            transport.reply_json(HttpMethod::Get, "/Geocode", 500, json!({}));
        }
        let resolver = resolver(&transport, Some("key"));

        let started = Instant::now();
        let err = resolver.reverse_geocode(saigon()).await.unwrap_err();

        assert!(matches!(err, GeocodeError::ProviderError { status: Some(500), .. }));
        assert_eq!(transport.count(HttpMethod::Get, "/Geocode"), 3);
        // 2s after the first failure, 4s after the second, nothing after the last
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_geocode_not_found_is_single_attempt() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(HttpMethod::Get, "/Geocode", 200, json!({"results": []}));
        let resolver = resolver(&transport, Some("key"));

        let started = Instant::now();
        assert_eq!(
            resolver.reverse_geocode(saigon()).await.unwrap_err(),
            GeocodeError::NotFound
        );
        assert_eq!(transport.count(HttpMethod::Get, "/Geocode"), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_geocode_client_error_not_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(HttpMethod::Get, "/Geocode", 400, json!({"message": "bad latlng"}));
        let resolver = resolver(&transport, Some("key"));

        let err = resolver.reverse_geocode(saigon()).await.unwrap_err();
        assert!(matches!(err, GeocodeError::ProviderError { status: Some(400), .. }));
        assert_eq!(transport.count(HttpMethod::Get, "/Geocode"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_geocode_malformed_body_not_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_raw(HttpMethod::Get, "/Geocode", 200, b"not json".to_vec());
        let resolver = resolver(&transport, Some("key"));

        assert!(resolver.reverse_geocode(saigon()).await.is_err());
        assert_eq!(transport.count(HttpMethod::Get, "/Geocode"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_geocode_recovers_on_second_attempt() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(HttpMethod::Get, "/Geocode", 503, json!({}));
        transport.reply_json(
            HttpMethod::Get,
            "/Geocode",
            200,
            hit("Nguyễn Huệ, Quận 1", 10.7741, 106.7038),
        );
        let resolver = resolver(&transport, Some("key"));

        let started = Instant::now();
        let resolved = resolver.reverse_geocode(saigon()).await.unwrap();

        assert_eq!(resolved.point, saigon());
        assert_eq!(resolved.formatted_address, "Nguyễn Huệ, Quận 1");
        assert_eq!(resolved.source, LocationSource::DeviceGps);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(
            transport.requests()[1].query_param("latlng").as_deref(),
            Some("10.776,106.7")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_geocode_timeouts_exhaust_to_timeout() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            transport.reply_hang(HttpMethod::Get, "/Geocode");
        }
        let resolver = resolver(&transport, Some("key"));

        let started = Instant::now();
        let err = resolver.reverse_geocode(saigon()).await.unwrap_err();

        assert_eq!(err, GeocodeError::Timeout { attempts: 3 });
        // three 15s timeouts plus 2s and 4s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(51));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_geocode_network_error_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_error(
            HttpMethod::Get,
            "/Geocode",
            HttpError::Connection {
                host: "geo.example.com".into(),
                message: "connection reset".into(),
            },
        );
        transport.reply_json(HttpMethod::Get, "/Geocode", 200, hit("Quận 3", 0.0, 0.0));
        let resolver = resolver(&transport, Some("key"));

        let resolved = resolver.reverse_geocode(saigon()).await.unwrap();
        assert_eq!(resolved.formatted_address, "Quận 3");
        assert_eq!(transport.count(HttpMethod::Get, "/Geocode"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_geocode_single_attempt_bound() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_json(HttpMethod::Get, "/Geocode", 502, json!({}));
        let resolver = resolver(&transport, Some("key"));

        let err = resolver
            .reverse_geocode_with_attempts(saigon(), 1)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.count(HttpMethod::Get, "/Geocode"), 1);
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_key_kept_out_of_logs_and_errors() {
        let logs = LogCapture::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_hang(HttpMethod::Get, "/Geocode");
        transport.reply_json(HttpMethod::Get, "/Geocode", 503, json!({"message": "busy"}));
        let resolver = resolver(&transport, Some("SUPERSECRETKEY"));

        let err = resolver
            .reverse_geocode_with_attempts(saigon(), 2)
            .await
            .unwrap_err();

        assert_eq!(
            transport.requests()[0].query_param("api_key").as_deref(),
            Some("SUPERSECRETKEY")
        );
        let output = logs.contents();
        assert!(output.contains("request timed out"), "{output}");
        assert!(output.contains("https://geo.example.com/Geocode"), "{output}");
        assert!(!output.contains("SUPERSECRETKEY"), "{output}");
        assert!(!AppError::from(err).to_string().contains("SUPERSECRETKEY"));
    }

    #[test]
    fn test_provider_failure_reads_as_location_service() {
        let err = AppError::from(GeocodeError::ProviderError {
            status: Some(500),
            message: "upstream".into(),
        });
        assert_eq!(
            err.user_facing_message(),
            "The location service is having trouble. Please try again later."
        );
    }
}

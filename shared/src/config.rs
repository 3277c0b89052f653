use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use thiserror::Error;

use crate::capabilities::ValidatedUrl;
use crate::error::{AppError, ErrorKind};

pub const ENV_API_BASE_URL: &str = "ROOM_API_BASE_URL";
pub const ENV_GEOCODER_BASE_URL: &str = "GEOCODER_BASE_URL";
pub const ENV_GEOCODER_API_KEY: &str = "GEOCODER_API_KEY";

pub const DEFAULT_GEOCODER_BASE_URL: &str = "https://rsapi.goong.io";
pub const REVERSE_GEOCODE_TIMEOUT: Duration = Duration::from_secs(15);
pub const REVERSE_GEOCODE_MAX_ATTEMPTS: u32 = 3;
pub const MAX_ALLOWED_ATTEMPTS: u32 = 5;
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const REGION_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("geocoding API key is not configured ({ENV_GEOCODER_API_KEY})")]
    MissingGeocoderKey,

    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        let kind = match e {
            ConfigError::MissingGeocoderKey => ErrorKind::MissingCredential,
            ConfigError::Missing(_) | ConfigError::Invalid { .. } => ErrorKind::Configuration,
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub reverse_timeout: Duration,
    pub reverse_max_attempts: u32,
    pub backoff_base: Duration,
    pub forward_timeout: Duration,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GEOCODER_BASE_URL.to_string(),
            api_key: None,
            reverse_timeout: REVERSE_GEOCODE_TIMEOUT,
            reverse_max_attempts: REVERSE_GEOCODE_MAX_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
            forward_timeout: REQUEST_TIMEOUT,
        }
    }
}

impl GeocoderConfig {
    /// Blank keys count as absent.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_ref()
            .map(|k| k.expose_secret().as_str())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub api_base_url: String,
    pub geocoder: GeocoderConfig,
    pub request_timeout: Duration,
    pub default_page_size: u32,
    pub region_cache_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.example.com".to_string(),
            geocoder: GeocoderConfig::default(),
            request_timeout: REQUEST_TIMEOUT,
            default_page_size: DEFAULT_PAGE_SIZE,
            region_cache_capacity: REGION_CACHE_CAPACITY,
        }
    }
}

impl DiscoveryConfig {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads settings through `lookup`, so shells can feed values from their own config store.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = lookup(ENV_API_BASE_URL)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(ENV_API_BASE_URL))?;

        let mut config = Self {
            api_base_url,
            ..Self::default()
        };

        if let Some(url) = lookup(ENV_GEOCODER_BASE_URL).filter(|v| !v.trim().is_empty()) {
            config.geocoder.base_url = url;
        }
        config.geocoder.api_key = lookup(ENV_GEOCODER_API_KEY)
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::new);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(self.api_base_url.as_str()).map_err(|e| ConfigError::Invalid {
            name: ENV_API_BASE_URL,
            reason: e.to_string(),
        })?;
        ValidatedUrl::new(self.geocoder.base_url.as_str()).map_err(|e| ConfigError::Invalid {
            name: ENV_GEOCODER_BASE_URL,
            reason: e.to_string(),
        })?;

        if self.geocoder.reverse_timeout.is_zero() || self.geocoder.forward_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "geocoder timeout",
                reason: "must be > 0".into(),
            });
        }
        if self.geocoder.reverse_max_attempts == 0
            || self.geocoder.reverse_max_attempts > MAX_ALLOWED_ATTEMPTS
        {
            return Err(ConfigError::Invalid {
                name: "reverse_max_attempts",
                reason: format!("must be between 1 and {MAX_ALLOWED_ATTEMPTS}"),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "request_timeout",
                reason: "must be > 0".into(),
            });
        }
        if self.default_page_size == 0 {
            return Err(ConfigError::Invalid {
                name: "default_page_size",
                reason: "must be > 0".into(),
            });
        }
        if self.region_cache_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "region_cache_capacity",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Credential problems that disable geocoding but nothing else.
    #[must_use]
    pub fn missing_credentials(&self) -> Option<ConfigError> {
        self.geocoder
            .api_key()
            .is_none()
            .then_some(ConfigError::MissingGeocoderKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        assert!(DiscoveryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_lookup_reads_all_settings() {
        let config = DiscoveryConfig::from_lookup(lookup_from(&[
            (ENV_API_BASE_URL, "https://rooms.example.com/api"),
            (ENV_GEOCODER_BASE_URL, "https://geo.example.com"),
            (ENV_GEOCODER_API_KEY, "k-123"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "https://rooms.example.com/api");
        assert_eq!(config.geocoder.base_url, "https://geo.example.com");
        assert_eq!(config.geocoder.api_key(), Some("k-123"));
        assert!(config.missing_credentials().is_none());
    }

    #[test]
    fn test_missing_api_base_url_is_error() {
        let result = DiscoveryConfig::from_lookup(lookup_from(&[]));
        assert_eq!(result.unwrap_err(), ConfigError::Missing(ENV_API_BASE_URL));
    }

    #[test]
    fn test_missing_geocoder_key_is_reported_not_fatal() {
        let config = DiscoveryConfig::from_lookup(lookup_from(&[(
            ENV_API_BASE_URL,
            "https://rooms.example.com",
        )]))
        .unwrap();
        assert_eq!(
            config.missing_credentials(),
            Some(ConfigError::MissingGeocoderKey)
        );
        let app: AppError = ConfigError::MissingGeocoderKey.into();
        assert_eq!(app.kind, ErrorKind::MissingCredential);
    }

    #[test]
    fn test_blank_key_counts_as_missing() {
        let mut config = DiscoveryConfig::default();
        config.geocoder.api_key = Some(SecretString::new("   ".into()));
        assert!(config.missing_credentials().is_some());
    }

    #[test]
    fn test_attempt_bound_enforced() {
        let mut config = DiscoveryConfig::default();
        config.geocoder.reverse_max_attempts = 0;
        assert!(config.validate().is_err());
        config.geocoder.reverse_max_attempts = MAX_ALLOWED_ATTEMPTS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_not_in_debug_output() {
        let mut config = DiscoveryConfig::default();
        config.geocoder.api_key = Some(SecretString::new("super-secret-key".into()));
        assert!(!format!("{config:?}").contains("super-secret-key"));
    }
}

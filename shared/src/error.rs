use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MissingCredential,
    Configuration,
    Timeout,
    ProviderError,
    NotFound,
    Network,
    StaleResult,
    Validation,
    PermissionDenied,
    LocationUnavailable,
    Deserialization,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::MissingCredential => "MISSING_CREDENTIAL",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Network => "NETWORK_ERROR",
            Self::StaleResult => "STALE_RESULT",
            Self::Validation => "VALIDATION_ERROR",
            Self::PermissionDenied => "LOCATION_PERMISSION_DENIED",
            Self::LocationUnavailable => "LOCATION_UNAVAILABLE",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Timeout
            | Self::ProviderError
            | Self::Network
            | Self::StaleResult
            | Self::LocationUnavailable => ErrorSeverity::Transient,

            Self::NotFound | Self::Validation | Self::PermissionDenied => {
                ErrorSeverity::Permanent
            }

            Self::MissingCredential
            | Self::Configuration
            | Self::Deserialization
            | Self::Internal => ErrorSeverity::Fatal,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::ProviderError | Self::Network)
    }

    /// Stale results are an internal consistency guard and never reach the user.
    #[must_use]
    pub const fn is_reportable(self) -> bool {
        !matches!(self, Self::StaleResult)
    }
}

/// Context key naming the upstream that produced an error.
pub const SERVICE_KEY: &str = "service";
pub const GEOCODING_SERVICE: &str = "geocoding";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    fn service(&self) -> Option<&str> {
        self.context.get(SERVICE_KEY).map(String::as_str)
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::MissingCredential => {
                "Address lookup is not available right now. Please pick your area from the list."
                    .into()
            }
            ErrorKind::Configuration => {
                "The app is not configured correctly. Please contact support.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::ProviderError if self.service() == Some(GEOCODING_SERVICE) => {
                "The location service is having trouble. Please try again later.".into()
            }
            ErrorKind::ProviderError => {
                "Our servers are having trouble. Please try again later.".into()
            }
            ErrorKind::NotFound => "No matching place was found for that address.".into(),
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::PermissionDenied => {
                "Location access is required. Please enable location permissions in Settings."
                    .into()
            }
            ErrorKind::LocationUnavailable => {
                "Unable to determine your location. Please check your GPS settings.".into()
            }
            ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::StaleResult | ErrorKind::Internal => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

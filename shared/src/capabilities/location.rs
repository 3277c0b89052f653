use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{AppError, ErrorKind};
use crate::model::GeoPoint;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location unavailable: {0}")]
    Unavailable(String),
}

impl From<LocationError> for AppError {
    fn from(e: LocationError) -> Self {
        let kind = match e {
            LocationError::PermissionDenied => ErrorKind::PermissionDenied,
            LocationError::Unavailable(_) => ErrorKind::LocationUnavailable,
        };
        AppError::new(kind, e.to_string())
    }
}

/// Device GPS as provided by the shell.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(&self) -> Result<GeoPoint, LocationError>;
}

/// Used when the shell has no GPS access at all.
pub struct NoLocation;

#[async_trait]
impl LocationProvider for NoLocation {
    async fn current_position(&self) -> Result<GeoPoint, LocationError> {
        Err(LocationError::PermissionDenied)
    }
}

use serde::{Deserialize, Serialize};

use crate::model::{GeoPoint, LocationSource, ResolvedLocation};
use crate::preferences::UserPreference;

/// Where the location driving a discovery query came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrioritySource {
    ExplicitSearch,
    SavedPreference,
    #[default]
    NoLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocationChoice {
    Explicit(ResolvedLocation),
    Saved(ResolvedLocation),
    /// Not an error: listings fall back to the non-geo default ranking.
    NoLocation,
}

impl LocationChoice {
    #[must_use]
    pub fn location(&self) -> Option<&ResolvedLocation> {
        match self {
            Self::Explicit(location) | Self::Saved(location) => Some(location),
            Self::NoLocation => None,
        }
    }

    #[must_use]
    pub fn point(&self) -> Option<GeoPoint> {
        self.location().map(|l| l.point)
    }

    #[must_use]
    pub const fn source(&self) -> PrioritySource {
        match self {
            Self::Explicit(_) => PrioritySource::ExplicitSearch,
            Self::Saved(_) => PrioritySource::SavedPreference,
            Self::NoLocation => PrioritySource::NoLocation,
        }
    }
}

/// Explicit location first, then saved coordinates (both required), then none.
#[must_use]
pub fn resolve(
    explicit: Option<&ResolvedLocation>,
    saved: Option<&UserPreference>,
) -> LocationChoice {
    if let Some(location) = explicit {
        return LocationChoice::Explicit(location.clone());
    }

    saved
        .and_then(|pref| {
            pref.point().map(|point| {
                ResolvedLocation::new(
                    point,
                    pref.search_address.clone().unwrap_or_default(),
                    LocationSource::SavedPreference,
                )
            })
        })
        .map_or(LocationChoice::NoLocation, LocationChoice::Saved)
}

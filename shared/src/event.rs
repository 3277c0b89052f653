use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::listings::Tier;
use crate::model::ResolvedLocation;
use crate::priority::PrioritySource;
use crate::regions::CascadeSelection;

// --- Notifications to the shell: large payloads boxed ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum DiscoveryEvent {
    // Preference
    PreferenceLoaded {
        found: bool,
    },
    PreferenceUnavailable,
    PreferenceSaved,
    EmailNotificationsChanged {
        enabled: bool,
    },

    // Location
    LocationResolved {
        source: PrioritySource,
        location: Option<Box<ResolvedLocation>>,
    },
    DisplayAreaChanged {
        text: String,
    },

    // Regions
    CascadeChanged(Box<CascadeSelection>),

    // Listings
    TierUpdated {
        tier: Tier,
        page_number: u32,
        total_pages: u32,
    },

    /// User-facing failure. Stale results never produce one.
    Notice(Box<AppError>),
}

impl DiscoveryEvent {
    pub(crate) fn notice(error: impl Into<AppError>) -> Self {
        Self::Notice(Box::new(error.into()))
    }

    pub(crate) fn location(source: PrioritySource, location: Option<&ResolvedLocation>) -> Self {
        Self::LocationResolved {
            source,
            location: location.cloned().map(Box::new),
        }
    }
}

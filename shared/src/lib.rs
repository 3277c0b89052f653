//! Location-aware discovery core for the room-rental client.
//!
//! The shell supplies an HTTP transport and a GPS provider through [`Capabilities`]; the
//! core resolves where the user is, keeps their saved preference in sync, drives the
//! province/district/ward picker and serves the premium and standard listing feeds.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod error;
pub mod event;
pub mod geocoding;
pub mod listings;
pub mod model;
pub mod preferences;
pub mod priority;
pub mod regions;
pub mod session;

pub use capabilities::Capabilities;
pub use config::DiscoveryConfig;
pub use error::{AppError, AppResult, ErrorKind, ErrorSeverity};
pub use event::DiscoveryEvent;
pub use geocoding::{GeoResolver, GeocodeError};
pub use listings::{DiscoveryFetcher, ListRoom, ListingPage, Tier};
pub use model::{GeoPoint, LocationSource, RegionId, ResolvedLocation, RoomId, UserId};
pub use preferences::{PreferencePatch, PreferenceSync, UserPreference};
pub use priority::{resolve, LocationChoice, PrioritySource};
pub use regions::{CascadeSelection, RegionCascade, RegionNode};
pub use session::{compose_display_area, DiscoverySession, DiscoveryView};

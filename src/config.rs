use crate::error::{RResult, RecorderError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Sampling period of the recording loop
pub const TICK_INTERVAL_MS: u64 = 200;

/// Hard cap on rows per session (10 minutes at 200 ms)
pub const MAX_ROWS: u32 = 3000;

/// Ride name placeholder used before setup has been confirmed
pub const NOT_SET_RIDE: &str = "NOT SET";

/// Ride name substituted into media file names when setup never named the ride
pub const UNSPECIFIED_RIDE: &str = "Unspecified Ride";

/// Setup values supplied before a recording may start.
///
/// Everything is optional here; `ride_setup()` is the gate that turns a
/// partially filled config into something `RecordingSession::start` accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSessionConfig {
    pub ride_name: Option<String>,
    pub seat_count: Option<u32>,
    /// Remote experiment the dataset is attached to
    pub target_id: Option<String>,
    pub session_name: Option<String>,
    /// Ride list comes from the venue preset rather than the generic list
    #[serde(default)]
    pub venue_preset: bool,
}

/// Validated ride/seat pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideSetup {
    pub ride_name: String,
    pub seat_count: u32,
}

impl AppSessionConfig {
    pub fn load(path: &Path) -> RResult<Self> {
        let json = fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> RResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Validated ride/seat pair, or `SetupRequired` if either is missing
    pub fn ride_setup(&self) -> RResult<RideSetup> {
        let ride_name = self
            .ride_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != NOT_SET_RIDE)
            .ok_or(RecorderError::SetupRequired)?;

        let seat_count = self
            .seat_count
            .filter(|seats| *seats > 0)
            .ok_or(RecorderError::SetupRequired)?;

        Ok(RideSetup {
            ride_name: ride_name.to_string(),
            seat_count,
        })
    }

    /// Target id if present and purely numeric
    pub fn valid_target_id(&self) -> Option<&str> {
        self.target_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
    }

    /// Session name, treating blank input as absent
    pub fn session_name(&self) -> Option<&str> {
        self.session_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Ride name for file naming, falling back to the placeholder
    pub fn ride_label(&self) -> &str {
        self.ride_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(NOT_SET_RIDE)
    }

    /// Fill unset fields from `base` (CLI values override file values)
    pub fn merged_over(self, base: AppSessionConfig) -> AppSessionConfig {
        AppSessionConfig {
            ride_name: self.ride_name.or(base.ride_name),
            seat_count: self.seat_count.or(base.seat_count),
            target_id: self.target_id.or(base.target_id),
            session_name: self.session_name.or(base.session_name),
            venue_preset: self.venue_preset || base.venue_preset,
        }
    }
}

/// Login state owned by the upload flow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    pub username: Option<String>,
    pub logged_in: bool,
}

impl AuthState {
    pub fn logged_in_as(username: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            logged_in: true,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in && self.username.is_some()
    }
}

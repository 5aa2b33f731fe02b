// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared state types observed by the display layer.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Link state to the peer. Owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "Disconnected",
            LinkState::Connecting => "Connecting...",
            LinkState::Connected => "Connected",
            LinkState::Lost => "Connection Lost",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmergencyPhase {
    #[default]
    Idle,
    Triggering,
    Active,
    Stopping,
}

impl EmergencyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyPhase::Idle => "Idle",
            EmergencyPhase::Triggering => "Triggering",
            EmergencyPhase::Active => "Active",
            EmergencyPhase::Stopping => "Stopping",
        }
    }
}

/// A latitude/longitude fix in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Google Maps link for this fix.
    pub fn map_link(&self) -> String {
        format!(
            "https://maps.google.com/?q={},{}",
            self.latitude, self.longitude
        )
    }

    /// True if either axis differs from `other` by more than `threshold` degrees.
    pub fn moved_beyond(&self, other: &Coordinates, threshold: f64) -> bool {
        (self.latitude - other.latitude).abs() > threshold
            || (self.longitude - other.longitude).abs() > threshold
    }
}

/// Snapshot of the current emergency episode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmergencySession {
    pub phase: EmergencyPhase,
    pub active: bool,
    pub location_sharing: bool,
    pub notifying: bool,
    pub started_at: Option<DateTime<Local>>,
    pub last_known_location: Option<Coordinates>,
}

impl EmergencySession {
    /// Session reset after a stop. The last fix survives so a later
    /// trigger can still fall back to it.
    pub fn cleared(&self) -> Self {
        Self {
            last_known_location: self.last_known_location,
            ..Self::default()
        }
    }
}

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

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::bluetooth::MAX_CONTACT_SLOTS;
use crate::state::Coordinates;

const APP_DIR: &str = "sos-companion";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bridge to connect to.
    pub peer: PeerConfig,

    /// Link timing and retry policy.
    pub link: LinkConfig,

    /// Location refresh settings.
    pub location: LocationConfig,

    /// User profile and emergency contacts.
    pub profile: ProfileConfig,

    /// Panic keyword settings.
    pub voice: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Bluetooth address of the paired serial bridge.
    pub address: String,

    /// RFCOMM channel of the bridge's serial port service.
    pub channel: u8,

    /// Socket connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Connect on startup.
    pub auto_connect: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: "29:50:0E:A7:8A:54".to_string(),
            channel: 1,
            connect_timeout_ms: 10_000,
            auto_connect: true,
        }
    }
}

impl PeerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a command waits for its response line.
    pub response_timeout_ms: u64,

    /// Timeout for the liveness probe.
    pub probe_timeout_ms: u64,

    /// Upper bound for one blocking line read in the read loop.
    pub read_timeout_ms: u64,

    /// Delay before each automatic reconnect attempt.
    pub reconnect_delay_ms: u64,

    /// Automatic reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,

    /// Interval between liveness probes while connected.
    pub liveness_interval_secs: u64,

    /// Pause between contact pushes during a sync.
    pub contact_sync_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1_000,
            probe_timeout_ms: 1_000,
            read_timeout_ms: 250,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 3,
            liveness_interval_secs: 30,
            contact_sync_delay_ms: 1_000,
        }
    }
}

impl LinkConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn contact_sync_delay(&self) -> Duration {
        Duration::from_millis(self.contact_sync_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Interval of the periodic location refresh.
    pub refresh_interval_secs: u64,

    /// Movement in degrees on either axis that triggers a resend (~50 m).
    pub movement_threshold_deg: f64,

    /// Fixed position reported by the static provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            movement_threshold_deg: 0.0005,
            latitude: None,
            longitude: None,
        }
    }
}

impl LocationConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn fixed_position(&self) -> Option<Coordinates> {
        Some(Coordinates::new(self.latitude?, self.longitude?))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Name used in the alert message.
    pub name: String,

    /// Emergency contact phone numbers, first one required.
    pub contacts: Vec<String>,

    /// Program invoked as `<cmd> <phone> <message>` to deliver an SMS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_command: Option<String>,
}

impl ProfileConfig {
    /// Contacts that pass validation, capped to the bridge's slot count.
    pub fn valid_contacts(&self) -> Vec<String> {
        let mut valid = Vec::new();
        for contact in &self.contacts {
            let contact = contact.trim();
            if contact.is_empty() {
                continue;
            }
            if let Err(reason) = validate_phone_number(contact) {
                warn!("Skipping contact '{}': {}", contact, reason);
                continue;
            }
            valid.push(contact.to_string());
        }

        if valid.len() > MAX_CONTACT_SLOTS {
            warn!(
                "{} contacts configured, using the first {}",
                valid.len(),
                MAX_CONTACT_SLOTS
            );
            valid.truncate(MAX_CONTACT_SLOTS);
        }
        valid
    }
}

/// Check a phone number: 10-15 chars of `+`, digits, spaces, `-`, `(`, `)`.
pub fn validate_phone_number(phone: &str) -> Result<(), &'static str> {
    if phone.len() < 10 {
        return Err("phone number must be at least 10 digits");
    }
    if phone.len() > 15 {
        return Err("phone number cannot exceed 15 digits");
    }

    let body = phone.strip_prefix('+').unwrap_or(phone);
    let well_formed = !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')'));
    if !well_formed {
        return Err("invalid phone number format");
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Words that raise a panic signal when heard in a transcript.
    pub keywords: Vec<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            keywords: [
                "help", "emergency", "police", "fire", "ambulance", "danger", "attack", "sos",
                "mayday", "rescue", "panic",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from the default file or create it.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

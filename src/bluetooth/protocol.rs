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

//! Wire format spoken with the bridge.
//!
//! ASCII lines terminated by `\r\n`. The phone sends commands; the bridge
//! answers each with one line and may also emit unsolicited status lines.

use std::fmt;

/// Line terminator appended to every outgoing command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Number of contact slots the bridge stores.
pub const MAX_CONTACT_SLOTS: usize = 3;

/// Commands sent to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Liveness probe.
    Ping,
    /// Start the alarm sequence.
    Sos,
    /// Cancel a running alarm.
    Cancel,
    /// Current position.
    Location { latitude: f64, longitude: f64 },
    /// Store a contact number in slot `index` (0-2).
    Contact { index: u8, number: String },
}

impl Command {
    /// Wire text without terminator.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Ping => "PING".to_string(),
            Self::Sos => "SOS".to_string(),
            Self::Cancel => "CANCEL".to_string(),
            Self::Location {
                latitude,
                longitude,
            } => format!("LOC:{},{}", latitude, longitude),
            Self::Contact { index, number } => format!("CONTACT{}:{}", index, number),
        }
    }

    /// Short label for status display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Sos => "SOS",
            Self::Cancel => "CANCEL",
            Self::Location { .. } => "LOC",
            Self::Contact { .. } => "CONTACT",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Kinds of unsolicited lines the bridge emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    AlarmStarted,
    AlarmFinished,
    AlarmCancelled,
    LocationRequested,
    ContactAck,
    PeerReady,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlarmStarted => "ALARM_STARTED",
            Self::AlarmFinished => "ALARM_FINISHED",
            Self::AlarmCancelled => "ALARM_CANCELLED",
            Self::LocationRequested => "LOCATION_REQUESTED",
            Self::ContactAck => "CONTACT_ACK",
            Self::PeerReady => "PEER_READY",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Data carried by an unsolicited line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    None,
    /// `CONTACT<index>:<value>` echoed by the bridge.
    Contact { index: u8, value: String },
}

/// An unsolicited line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsolicitedEvent {
    pub raw: String,
    pub kind: EventKind,
    pub payload: EventPayload,
}

/// Flat ordered prefix table. First match wins.
const PREFIX_RULES: &[(&str, EventKind)] = &[
    ("SOS_STARTED", EventKind::AlarmStarted),
    ("SOS_DONE", EventKind::AlarmFinished),
    ("SOS_CANCELLED", EventKind::AlarmCancelled),
    ("LOC_REQ", EventKind::LocationRequested),
    ("OK CONTACT UPDATED", EventKind::ContactAck),
    ("READY", EventKind::PeerReady),
];

impl UnsolicitedEvent {
    /// Classify a raw line. Lines matching nothing are `Unknown`.
    pub fn classify(raw: &str) -> Self {
        let line = raw.trim();

        for (prefix, kind) in PREFIX_RULES {
            if line.starts_with(prefix) {
                return Self {
                    raw: line.to_string(),
                    kind: *kind,
                    payload: EventPayload::None,
                };
            }
        }

        if let Some((index, value)) = parse_contact_line(line) {
            return Self {
                raw: line.to_string(),
                kind: EventKind::ContactAck,
                payload: EventPayload::Contact { index, value },
            };
        }

        Self {
            raw: line.to_string(),
            kind: EventKind::Unknown,
            payload: EventPayload::None,
        }
    }
}

/// Parse `CONTACT<n>:<value>`.
fn parse_contact_line(line: &str) -> Option<(u8, String)> {
    let rest = line.strip_prefix("CONTACT")?;
    let (index, value) = rest.split_once(':')?;
    let index: u8 = index.parse().ok()?;
    Some((index, value.trim().to_string()))
}

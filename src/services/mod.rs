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

//! Collaborators the emergency workflow depends on.
//!
//! The orchestrator only talks to these traits. The daemon's concrete
//! implementations live in [`console`].

pub mod console;

use anyhow::Result;
use futures::future::BoxFuture;

use crate::keywords::PanicCue;
use crate::state::{Coordinates, EmergencySession};

pub use console::{CommandNotifier, ConsoleSurface, StaticLocationProvider};

/// Source of the device position.
pub trait LocationProvider: Send + Sync {
    /// Fetch a current fix.
    fn current_location(&self) -> BoxFuture<'_, Result<Coordinates>>;
}

/// Delivers the alert message to one emergency contact.
///
/// Fire-and-forget: `Ok` means the delivery was handed off, not that the
/// contact received it.
pub trait ContactNotifier: Send + Sync {
    fn notify_contact(&self, phone: &str, message: &str) -> Result<()>;
}

/// Surface that tells the user an emergency is in progress.
pub trait AlertSurface: Send + Sync {
    fn show(&self, session: &EmergencySession) -> Result<()>;
    fn hide(&self) -> Result<()>;
}

/// Anything that can raise panic cues, e.g. a speech recogniser.
pub trait PanicSignal: Send + Sync {
    /// Queue receiving one cue per detection.
    fn cues(&self) -> async_channel::Receiver<PanicCue>;
}

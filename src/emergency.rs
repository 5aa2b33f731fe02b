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

//! Emergency workflow.
//!
//! A trigger runs five steps: show the alert, locate, tell the peer, notify
//! contacts, go active. Every step may fail on its own; none of them can
//! stop the session from becoming active. Peer participation is always
//! best-effort.

use chrono::{DateTime, Local};
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bluetooth::{Command, ConnectionManager, LinkError, LinkResult, MAX_CONTACT_SLOTS};
use crate::config::Config;
use crate::keywords::PanicCue;
use crate::services::{AlertSurface, ContactNotifier, LocationProvider};
use crate::state::{Coordinates, EmergencyPhase, EmergencySession};

/// Upper bound for one location fetch.
const LOCATION_TIMEOUT: Duration = Duration::from_secs(15);

/// How often a send waits out another caller's pending command.
const BUSY_RETRIES: u32 = 3;
const BUSY_PAUSE: Duration = Duration::from_millis(100);

/// Who asked for the emergency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Button or console.
    Manual,
    /// Panic keyword heard.
    Voice,
    /// The bridge started its alarm on its own.
    Peer,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Voice => "voice",
            TriggerSource::Peer => "peer",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one orchestration step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Done,
    /// Completed with a degraded input, e.g. a stale location.
    Fallback(String),
    /// Not attempted.
    Skipped(String),
    Failed(String),
}

impl StepResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepResult::Failed(_))
    }
}

/// Per-step record of one accepted trigger.
#[derive(Debug, Clone)]
pub struct TriggerReport {
    pub source: TriggerSource,
    pub surface: StepResult,
    pub location: StepResult,
    pub peer: StepResult,
    pub contacts: Vec<(String, StepResult)>,
    /// Fix used for the peer and the alert message.
    pub location_used: Option<Coordinates>,
    /// False when a stop arrived before the session became active.
    pub activated: bool,
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Started(TriggerReport),
    /// An emergency was already in this phase.
    Ignored(EmergencyPhase),
}

impl TriggerOutcome {
    pub fn report(&self) -> Option<&TriggerReport> {
        match self {
            TriggerOutcome::Started(report) => Some(report),
            TriggerOutcome::Ignored(_) => None,
        }
    }
}

/// External collaborators of the workflow.
#[derive(Clone)]
pub struct Collaborators {
    pub location: Arc<dyn LocationProvider>,
    pub notifier: Arc<dyn ContactNotifier>,
    pub surface: Arc<dyn AlertSurface>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Name used in the alert message.
    pub user_name: String,
    /// Validated contacts, at most one per peer slot.
    pub contacts: Vec<String>,
    pub movement_threshold_deg: f64,
    pub refresh_interval: Duration,
    pub contact_sync_delay: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_name: config.profile.name.clone(),
            contacts: config.profile.valid_contacts(),
            movement_threshold_deg: config.location.movement_threshold_deg,
            refresh_interval: config.location.refresh_interval(),
            contact_sync_delay: config.link.contact_sync_delay(),
        }
    }
}

/// Alert text sent to every contact.
pub fn compose_alert_message(
    user_name: &str,
    location: Option<Coordinates>,
    at: DateTime<Local>,
) -> String {
    let name = if user_name.trim().is_empty() {
        "Someone"
    } else {
        user_name.trim()
    };
    let location_text = location
        .map(|fix| fix.map_link())
        .unwrap_or_else(|| "Location unavailable".to_string());

    format!(
        "EMERGENCY ALERT\n\n\
         {} has triggered an emergency alert.\n\n\
         Location: {}\n\n\
         Time: {}\n\n\
         Please check on them immediately or contact local emergency services.",
        name,
        location_text,
        at.format("%b %d, %Y %H:%M")
    )
}

/// Run a synchronous collaborator call, turning errors and panics into a step failure.
fn guarded(what: &str, call: impl FnOnce() -> anyhow::Result<()>) -> StepResult {
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => StepResult::Done,
        Ok(Err(e)) => {
            warn!("{} failed: {}", what, e);
            StepResult::Failed(e.to_string())
        }
        Err(_) => {
            warn!("{} panicked", what);
            StepResult::Failed(format!("{} panicked", what))
        }
    }
}

/// The emergency state machine.
pub struct EmergencyOrchestrator {
    link: Arc<ConnectionManager>,
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    session_tx: watch::Sender<EmergencySession>,
    status_tx: watch::Sender<String>,
    /// Serializes this orchestrator's own peer commands.
    peer_lock: tokio::sync::Mutex<()>,
    /// Last fix the peer acknowledged.
    last_sent: Mutex<Option<Coordinates>>,
}

impl EmergencyOrchestrator {
    pub fn new(
        link: Arc<ConnectionManager>,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let (session_tx, _) = watch::channel(EmergencySession::default());
        let (status_tx, _) = watch::channel(link.state().as_str().to_string());

        Arc::new(Self {
            link,
            collaborators,
            settings,
            session_tx,
            status_tx,
            peer_lock: tokio::sync::Mutex::new(()),
            last_sent: Mutex::new(None),
        })
    }

    pub fn link(&self) -> &Arc<ConnectionManager> {
        &self.link
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> EmergencySession {
        self.session_tx.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<EmergencySession> {
        self.session_tx.subscribe()
    }

    pub fn phase(&self) -> EmergencyPhase {
        self.session_tx.borrow().phase
    }

    /// Human-readable peer status.
    pub fn status(&self) -> String {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<String> {
        self.status_tx.subscribe()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!("Status: {}", status);
            *current = status;
            true
        });
    }

    /// Start an emergency. Ignored unless idle.
    pub async fn trigger(&self, source: TriggerSource) -> TriggerOutcome {
        let started_at = Local::now();
        let accepted = self.session_tx.send_if_modified(|session| {
            if session.phase != EmergencyPhase::Idle {
                return false;
            }
            *session = EmergencySession {
                phase: EmergencyPhase::Triggering,
                active: true,
                location_sharing: true,
                notifying: true,
                started_at: Some(started_at),
                last_known_location: session.last_known_location,
            };
            true
        });

        if !accepted {
            let phase = self.phase();
            info!(
                "Trigger ({}) ignored, emergency already {}",
                source,
                phase.as_str()
            );
            return TriggerOutcome::Ignored(phase);
        }
        warn!("Emergency triggered ({})", source);

        let snapshot = self.session();
        let surface = guarded("Alert surface", || {
            self.collaborators.surface.show(&snapshot)
        });

        let (location_used, location) = self.fetch_location().await;
        let peer = self.alert_peer(source, location_used, started_at).await;
        let contacts = self.notify_contacts(location_used, started_at);

        let activated = self.session_tx.send_if_modified(|session| {
            if session.phase != EmergencyPhase::Triggering
                || session.started_at != Some(started_at)
            {
                return false;
            }
            session.phase = EmergencyPhase::Active;
            session.notifying = false;
            true
        });
        if activated {
            info!("Emergency active");
        } else {
            info!("Emergency was stopped before it became active");
        }

        TriggerOutcome::Started(TriggerReport {
            source,
            surface,
            location,
            peer,
            contacts,
            location_used,
            activated,
        })
    }

    /// Whether the trigger that started at `started_at` is still in progress.
    fn still_triggering(&self, started_at: DateTime<Local>) -> bool {
        let session = self.session_tx.borrow();
        session.phase == EmergencyPhase::Triggering && session.started_at == Some(started_at)
    }

    /// Stop the emergency and cancel the peer's alarm. False if nothing was running.
    pub async fn stop(&self) -> bool {
        self.stop_inner(true).await
    }

    /// The peer cancelled its alarm; stop locally without echoing `CANCEL`.
    pub async fn handle_peer_cancel(&self) -> bool {
        self.set_status("SOS Cancelled");
        self.stop_inner(false).await
    }

    async fn stop_inner(&self, cancel_peer: bool) -> bool {
        let stopping = self.session_tx.send_if_modified(|session| {
            if !matches!(
                session.phase,
                EmergencyPhase::Triggering | EmergencyPhase::Active
            ) {
                return false;
            }
            session.phase = EmergencyPhase::Stopping;
            true
        });
        if !stopping {
            debug!("Stop ignored, no emergency running");
            return false;
        }
        info!("Stopping emergency");

        if cancel_peer && self.link.state().is_connected() {
            match self.send_to_peer(&Command::Cancel).await {
                Ok(response) => {
                    info!("Peer acknowledged cancel: {}", response);
                    self.set_status("SOS Cancelled");
                }
                Err(e) => warn!("Cancel command failed: {}", e),
            }
        }

        guarded("Alert surface", || self.collaborators.surface.hide());
        self.session_tx.send_modify(|session| *session = session.cleared());
        info!("Emergency stopped");
        true
    }

    /// The peer finished its alarm sequence.
    pub fn handle_peer_finished(&self) {
        self.session_tx.send_if_modified(|session| {
            if !session.notifying {
                return false;
            }
            session.notifying = false;
            true
        });
        self.set_status("SOS Done");
    }

    /// Fetch a fix and push it to the peer right away, whatever the session state.
    pub async fn share_location(&self) -> StepResult {
        let (fix, step) = self.fetch_location().await;
        let Some(fix) = fix else {
            return step;
        };
        if !self.link.state().is_connected() {
            return StepResult::Skipped("peer not connected".to_string());
        }
        match self.send_location(fix).await {
            Ok(_) => step,
            Err(e) => {
                warn!("Location send failed: {}", e);
                StepResult::Failed(e.to_string())
            }
        }
    }

    /// Push the contact list and the last known fix to the peer.
    /// Stops at the first failed push.
    pub async fn sync_peer(&self) -> StepResult {
        if !self.link.state().is_connected() {
            return StepResult::Skipped("peer not connected".to_string());
        }
        let contacts = &self.settings.contacts;
        if contacts.is_empty() {
            warn!("No emergency contacts configured, nothing to sync");
        } else {
            info!("Syncing {} contacts to peer", contacts.len());
        }

        for (index, phone) in contacts.iter().take(MAX_CONTACT_SLOTS).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.contact_sync_delay).await;
            }
            let command = Command::Contact {
                index: index as u8,
                number: phone.clone(),
            };
            match self.send_to_peer(&command).await {
                Ok(response) => {
                    debug!("Contact slot {} acknowledged: {}", index, response);
                    self.set_status(format!("Contact {} Updated", index + 1));
                }
                Err(e) => {
                    warn!("Contact sync aborted at slot {}: {}", index, e);
                    return StepResult::Failed(format!("contact {}: {}", index, e));
                }
            }
        }

        let fix = match self.session().last_known_location {
            Some(fix) => Some(fix),
            None => self.fetch_location().await.0,
        };
        if let Some(fix) = fix {
            if !contacts.is_empty() {
                tokio::time::sleep(self.settings.contact_sync_delay).await;
            }
            if let Err(e) = self.send_location(fix).await {
                warn!("Location sync failed: {}", e);
                return StepResult::Failed(format!("location: {}", e));
            }
        }
        info!("Peer sync complete");
        StepResult::Done
    }

    /// Re-send the position if it moved beyond the threshold since the
    /// last send. Returns whether a `LOC` went out.
    pub async fn refresh_location(&self) -> bool {
        if !self.link.state().is_connected() {
            return false;
        }
        let fix = match self.locate().await {
            Ok(fix) => fix,
            Err(e) => {
                debug!("Location refresh skipped: {}", e);
                return false;
            }
        };

        let last_sent = *self.last_sent.lock();
        if let Some(previous) = last_sent {
            if !fix.moved_beyond(&previous, self.settings.movement_threshold_deg) {
                debug!("Position unchanged, not resending");
                return false;
            }
        }

        match self.send_location(fix).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Location refresh failed: {}", e);
                false
            }
        }
    }

    /// Periodic location refresh, for as long as the orchestrator lives.
    pub fn spawn_location_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::downgrade(self);
        let period = self.settings.refresh_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    return;
                };
                orchestrator.refresh_location().await;
            }
        })
    }

    /// Trigger on every panic cue.
    pub fn attach_panic_source(
        self: &Arc<Self>,
        cues: async_channel::Receiver<PanicCue>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Ok(cue) = cues.recv().await {
                let Some(orchestrator) = orchestrator.upgrade() else {
                    return;
                };
                info!("Panic cue '{}' received", cue.keyword);
                orchestrator.trigger(TriggerSource::Voice).await;
            }
            debug!("Panic source closed");
        })
    }

    /// Ask the provider for a fix, bounded and panic-guarded. Remembers it on success.
    async fn locate(&self) -> Result<Coordinates, String> {
        let fetch = AssertUnwindSafe(self.collaborators.location.current_location()).catch_unwind();

        let result = match tokio::time::timeout(LOCATION_TIMEOUT, fetch).await {
            Ok(Ok(Ok(fix))) => Ok(fix),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(_)) => Err("location provider panicked".to_string()),
            Err(_) => Err("location request timed out".to_string()),
        };

        if let Ok(fix) = result {
            self.session_tx.send_if_modified(|session| {
                if session.last_known_location == Some(fix) {
                    return false;
                }
                session.last_known_location = Some(fix);
                true
            });
        }
        result
    }

    /// Fix for the workflow: fresh, else last known, else none.
    async fn fetch_location(&self) -> (Option<Coordinates>, StepResult) {
        match self.locate().await {
            Ok(fix) => (Some(fix), StepResult::Done),
            Err(reason) => {
                warn!("Location unavailable: {}", reason);
                match self.session().last_known_location {
                    Some(fix) => (
                        Some(fix),
                        StepResult::Fallback(format!("{}, using last known location", reason)),
                    ),
                    None => (None, StepResult::Failed(reason)),
                }
            }
        }
    }

    /// Holds `peer_lock` throughout, so a concurrent stop's `CANCEL` goes
    /// out after `SOS`, or finds the trigger already stopped.
    async fn alert_peer(
        &self,
        source: TriggerSource,
        fix: Option<Coordinates>,
        started_at: DateTime<Local>,
    ) -> StepResult {
        if !self.link.state().is_connected() {
            info!("Peer not connected, continuing without it");
            return StepResult::Skipped("peer not connected".to_string());
        }

        let _guard = self.peer_lock.lock().await;
        if !self.still_triggering(started_at) {
            info!("Emergency stopped, not alerting the peer");
            return StepResult::Skipped("stopped".to_string());
        }

        let mut failures = Vec::new();
        if let Some(fix) = fix {
            if let Err(e) = self.push_location(fix).await {
                warn!("Location send failed: {}", e);
                failures.push(format!("LOC: {}", e));
            }
        }

        if source == TriggerSource::Peer {
            debug!("Alarm started by the peer, not sending SOS back");
        } else if !self.still_triggering(started_at) {
            info!("Emergency stopped, not sending SOS");
        } else {
            match self.send_locked(&Command::Sos).await {
                Ok(response) => {
                    info!("Peer acknowledged SOS: {}", response);
                    self.set_status("SOS Triggered");
                }
                Err(e) => {
                    warn!("SOS command failed: {}", e);
                    failures.push(format!("SOS: {}", e));
                }
            }
        }

        if failures.is_empty() {
            StepResult::Done
        } else {
            StepResult::Failed(failures.join(", "))
        }
    }

    fn notify_contacts(
        &self,
        fix: Option<Coordinates>,
        started_at: DateTime<Local>,
    ) -> Vec<(String, StepResult)> {
        if self.settings.contacts.is_empty() {
            warn!("No emergency contacts configured");
            return Vec::new();
        }

        let message = compose_alert_message(&self.settings.user_name, fix, Local::now());
        self.settings
            .contacts
            .iter()
            .map(|phone| {
                if !self.still_triggering(started_at) {
                    debug!("Emergency stopped, not notifying {}", phone);
                    return (phone.clone(), StepResult::Skipped("stopped".to_string()));
                }
                let result = guarded(&format!("Notifying {}", phone), || {
                    self.collaborators.notifier.notify_contact(phone, &message)
                });
                (phone.clone(), result)
            })
            .collect()
    }

    async fn send_location(&self, fix: Coordinates) -> LinkResult<String> {
        let _guard = self.peer_lock.lock().await;
        self.push_location(fix).await
    }

    /// Send `LOC` and remember the fix. Caller holds `peer_lock`.
    async fn push_location(&self, fix: Coordinates) -> LinkResult<String> {
        let command = Command::Location {
            latitude: fix.latitude,
            longitude: fix.longitude,
        };
        let response = self.send_locked(&command).await?;
        debug!("Peer acknowledged location: {}", response);
        *self.last_sent.lock() = Some(fix);
        self.set_status("Location Sent");
        Ok(response)
    }

    async fn send_to_peer(&self, command: &Command) -> LinkResult<String> {
        let _guard = self.peer_lock.lock().await;
        self.send_locked(command).await
    }

    /// Send one command, waiting out a probe that holds the link.
    /// Caller holds `peer_lock`.
    async fn send_locked(&self, command: &Command) -> LinkResult<String> {
        let mut retries = 0;

        loop {
            match self.link.send(command).await {
                Err(LinkError::AlreadyPending) if retries < BUSY_RETRIES => {
                    retries += 1;
                    debug!("Link busy, retrying {} ({})", command.label(), retries);
                    tokio::time::sleep(BUSY_PAUSE).await;
                }
                result => return result,
            }
        }
    }
}

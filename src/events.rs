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

//! Event processing and dispatch.
//!
//! Drains the peer's unsolicited events and link state changes from their
//! queues in arrival order and turns them into orchestrator calls.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bluetooth::{EventKind, EventPayload, SubscriptionId, UnsolicitedEvent};
use crate::emergency::{EmergencyOrchestrator, StepResult, TriggerSource};
use crate::state::LinkState;

/// Process events from the peer link.
pub struct EventProcessor {
    orchestrator: Arc<EmergencyOrchestrator>,
    subscription: SubscriptionId,
    events: async_channel::Receiver<UnsolicitedEvent>,
    link_state: watch::Receiver<LinkState>,
}

impl EventProcessor {
    /// Subscribe to the orchestrator's link.
    pub fn new(orchestrator: Arc<EmergencyOrchestrator>) -> Self {
        let (subscription, events) = orchestrator.link().subscribe();
        let link_state = orchestrator.link().watch_state();
        Self {
            orchestrator,
            subscription,
            events,
            link_state,
        }
    }

    /// Run until the link goes away.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => self.process_event(event).await,
                    Err(_) => break,
                },
                changed = self.link_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.link_state.borrow_and_update();
                    self.process_link_state(state);
                }
            }
        }
        debug!("Event processor stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process a single unsolicited event.
    ///
    /// Work that talks to the peer or waits on location runs in its own
    /// task, so the queue keeps draining while it is in flight.
    pub async fn process_event(&self, event: UnsolicitedEvent) {
        match event.kind {
            EventKind::AlarmStarted => {
                info!("Peer started its alarm");
                let orchestrator = self.orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator.trigger(TriggerSource::Peer).await;
                });
            }
            EventKind::AlarmFinished => {
                info!("Peer finished its alarm");
                self.orchestrator.handle_peer_finished();
            }
            EventKind::AlarmCancelled => {
                info!("Peer cancelled the alarm");
                self.orchestrator.handle_peer_cancel().await;
            }
            EventKind::LocationRequested => {
                info!("Peer requested location");
                let orchestrator = self.orchestrator.clone();
                tokio::spawn(async move {
                    match orchestrator.share_location().await {
                        StepResult::Done | StepResult::Fallback(_) => {}
                        other => warn!("Could not answer location request: {:?}", other),
                    }
                });
            }
            EventKind::PeerReady => {
                info!("Peer ready, syncing");
                self.spawn_sync();
            }
            EventKind::ContactAck => match event.payload {
                EventPayload::Contact { index, value } => {
                    info!("Peer holds contact {}: {}", index, value)
                }
                EventPayload::None => debug!("Peer acknowledged contact update"),
            },
            EventKind::Unknown => debug!("Unrecognised peer line: {}", event.raw),
        }
    }

    fn process_link_state(&self, state: LinkState) {
        match state {
            LinkState::Connected => {
                let link = self.orchestrator.link();
                if link.peer_responding() {
                    self.orchestrator.set_status("Connected");
                } else {
                    self.orchestrator.set_status("Connected (No Response)");
                }
                self.spawn_sync();
            }
            other => self.orchestrator.set_status(other.as_str()),
        }
    }

    fn spawn_sync(&self) {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.sync_peer().await;
        });
    }
}

impl Drop for EventProcessor {
    fn drop(&mut self) {
        self.orchestrator.link().unsubscribe(self.subscription);
    }
}

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

//! Request/response channel and unsolicited event bus on top of the transport.
//!
//! At most one command is outstanding. While it is pending the very next
//! line read is its response, whatever that line looks like. Lines read
//! with nothing pending are classified and fanned out to subscribers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::error::{LinkError, LinkResult};
use super::protocol::{Command, UnsolicitedEvent, LINE_TERMINATOR};
use super::transport::{CloseHandle, ReadOutcome, SerialTransport, TransportReader, TransportWriter};

/// Identifies one event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of unsolicited events, one queue per subscriber.
///
/// The bus outlives individual connections so subscribers keep their
/// queue across reconnects.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, async_channel::Sender<UnsolicitedEvent>)>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscriber. Events arrive in read order.
    pub fn subscribe(&self) -> (SubscriptionId, async_channel::Receiver<UnsolicitedEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.lock().push((id, tx));
        (id, rx)
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Deliver an event to every subscriber, dropping the ones whose
    /// receiver is gone.
    pub fn dispatch(&self, event: UnsolicitedEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Dropping closed subscriber {:?}", id);
                false
            }
        });
    }
}

/// The single outstanding command.
struct PendingCommand {
    text: String,
    issued_at: Instant,
    response_timeout: Duration,
    reply: oneshot::Sender<String>,
}

/// State shared between callers and the read loop.
struct Shared {
    pending: Mutex<Option<PendingCommand>>,
    bus: Arc<EventBus>,
}

impl Shared {
    /// Route one line: to the pending command if any, otherwise to the bus.
    fn route(&self, line: String) {
        let pending = self.pending.lock().take();

        match pending {
            Some(command) => {
                debug!(
                    "Response to '{}' after {:?} (limit {:?}): {}",
                    command.text,
                    command.issued_at.elapsed(),
                    command.response_timeout,
                    line
                );
                let _ = command.reply.send(line);
            }
            None => {
                let event = UnsolicitedEvent::classify(&line);
                debug!("Unsolicited {}: {}", event.kind.as_str(), event.raw);
                self.bus.dispatch(event);
            }
        }
    }
}

/// Correlated command channel over one open transport.
pub struct CommandChannel {
    /// Holding this lock is holding the single pending-command slot.
    writer: tokio::sync::Mutex<TransportWriter>,
    shared: Arc<Shared>,
    closer: CloseHandle,
    ended: watch::Receiver<bool>,
}

impl CommandChannel {
    /// Take ownership of the transport and start its read loop.
    pub fn start(
        transport: SerialTransport,
        bus: Arc<EventBus>,
        read_timeout: Duration,
    ) -> Arc<Self> {
        let closer = transport.close_handle();
        let (reader, writer) = transport.into_split();
        let (ended_tx, ended_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            bus,
        });

        tokio::spawn(Self::read_loop(
            reader,
            shared.clone(),
            closer.clone(),
            read_timeout,
            ended_tx,
        ));

        Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            shared,
            closer,
            ended: ended_rx,
        })
    }

    async fn read_loop(
        mut reader: TransportReader,
        shared: Arc<Shared>,
        closer: CloseHandle,
        read_timeout: Duration,
        ended_tx: watch::Sender<bool>,
    ) {
        debug!("Read loop started");

        loop {
            match reader.read_line(read_timeout).await {
                Ok(ReadOutcome::Line(line)) => shared.route(line),
                Ok(ReadOutcome::Timeout) => continue,
                Err(e) => {
                    if closer.is_closed() {
                        debug!("Read loop stopping: {}", e);
                    } else {
                        warn!("Read error: {}", e);
                        closer.close();
                    }
                    break;
                }
            }
        }

        // Dropping the reply sender wakes a waiting caller with LinkDown.
        shared.pending.lock().take();
        let _ = ended_tx.send(true);
        info!("Read loop ended");
    }

    /// Send a command and wait for the next line as its response.
    pub async fn send(&self, command: &Command, timeout: Duration) -> LinkResult<String> {
        self.send_text(&command.to_wire(), timeout).await
    }

    /// Send raw command text, appending the line terminator.
    ///
    /// Rejects immediately with `AlreadyPending` if another command is
    /// outstanding; callers serialize their own commands.
    pub async fn send_text(&self, text: &str, timeout: Duration) -> LinkResult<String> {
        let mut writer = self
            .writer
            .try_lock()
            .map_err(|_| LinkError::AlreadyPending)?;

        if self.is_closed() {
            return Err(LinkError::LinkDown);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        *self.shared.pending.lock() = Some(PendingCommand {
            text: text.to_string(),
            issued_at: Instant::now(),
            response_timeout: timeout,
            reply: reply_tx,
        });

        let line = format!("{}{}", text, LINE_TERMINATOR);
        if let Err(e) = writer.write(line.as_bytes()).await {
            warn!("Write of '{}' failed: {}", text, e);
            self.shared.pending.lock().take();
            self.closer.close();
            return Err(e);
        }
        debug!("Sent: {}", text);

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(LinkError::LinkDown),
            Err(_) => {
                self.shared.pending.lock().take();
                debug!("No response to '{}' within {:?}", text, timeout);
                Err(LinkError::Timeout)
            }
        }
    }

    /// Whether a command is currently awaiting its response.
    pub fn is_pending(&self) -> bool {
        self.shared.pending.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed() || *self.ended.borrow()
    }

    /// Close the underlying transport. Unblocks the read loop and any waiting send.
    pub fn close(&self) {
        self.closer.close();
    }

    /// Resolve once the read loop has ended, for whatever reason.
    pub async fn closed(&self) {
        let mut ended = self.ended.clone();
        let _ = ended.wait_for(|ended| *ended).await;
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.closer.close();
    }
}

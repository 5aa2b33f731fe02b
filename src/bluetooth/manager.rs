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

//! Link lifecycle: connect, probe, disconnect and bounded reconnection.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{CommandChannel, EventBus, SubscriptionId};
use super::error::{LinkError, LinkResult};
use super::protocol::{Command, UnsolicitedEvent};
use super::transport::{PeerOpener, SerialTransport};
use crate::config::LinkConfig;
use crate::state::LinkState;

/// Automatic reconnect attempts made since the last successful connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBudget {
    pub attempts: u32,
    pub max: u32,
}

impl ReconnectBudget {
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    /// Count one more attempt. Returns false once the budget is spent;
    /// `attempts` never goes past `max`.
    pub fn record_attempt(&mut self) -> bool {
        if self.attempts >= self.max {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Owns the link to the peer and its state.
pub struct ConnectionManager {
    opener: Arc<dyn PeerOpener>,
    config: LinkConfig,
    bus: Arc<EventBus>,
    state_tx: watch::Sender<LinkState>,
    channel: RwLock<Option<Arc<CommandChannel>>>,
    budget: Mutex<ReconnectBudget>,
    peer_id: Mutex<Option<String>>,
    /// Bumped on every new connection and on disconnect; stale tasks compare
    /// against it and stand down.
    generation: AtomicU64,
    /// Whether the last connect probe got an answer.
    probe_answered: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    liveness_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager. Nothing is opened until `connect` is called.
    pub fn new(opener: Arc<dyn PeerOpener>, config: LinkConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let budget = ReconnectBudget::new(config.max_reconnect_attempts);

        Arc::new(Self {
            opener,
            config,
            bus: EventBus::new(),
            state_tx,
            channel: RwLock::new(None),
            budget: Mutex::new(budget),
            peer_id: Mutex::new(None),
            generation: AtomicU64::new(0),
            probe_answered: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
            reconnect_task: Mutex::new(None),
            liveness_task: Mutex::new(None),
        })
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Observe link state changes.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn reconnect_budget(&self) -> ReconnectBudget {
        *self.budget.lock()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.peer_id.lock().clone()
    }

    /// False if the peer stayed silent to the last connect probe.
    pub fn peer_responding(&self) -> bool {
        self.probe_answered.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Subscribe to unsolicited events. The subscription survives reconnects.
    pub fn subscribe(&self) -> (SubscriptionId, async_channel::Receiver<UnsolicitedEvent>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Link state {} -> {}", current.as_str(), state.as_str());
            *current = state;
            true
        });
    }

    /// Connect to `peer_id`. A no-op when already connected.
    ///
    /// A failed connect leaves the link `Disconnected`; retriable failures
    /// also schedule automatic attempts within the reconnect budget.
    pub async fn connect(self: &Arc<Self>, peer_id: &str) -> LinkResult<()> {
        let _guard = self.connect_lock.lock().await;

        if self.state().is_connected() {
            debug!("Already connected, ignoring connect");
            return Ok(());
        }

        self.cancel_reconnect();
        self.budget.lock().reset();
        *self.peer_id.lock() = Some(peer_id.to_string());
        let generation = self.generation.load(Ordering::SeqCst);

        info!("Connecting to {}...", peer_id);
        match self.establish(peer_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Connect to {} failed: {}", peer_id, e);
                // A disconnect during the attempt bumps the generation.
                if e.is_retriable() && self.generation.load(Ordering::SeqCst) == generation {
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    /// Open the stream, start the channel and probe the peer.
    /// Caller holds `connect_lock`.
    async fn establish(self: &Arc<Self>, peer_id: &str) -> LinkResult<()> {
        let started = self.generation.load(Ordering::SeqCst);
        self.set_state(LinkState::Connecting);

        let stream = match self.opener.open(peer_id).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                return Err(e);
            }
        };

        let channel = CommandChannel::start(
            SerialTransport::new(stream),
            self.bus.clone(),
            self.config.read_timeout(),
        );

        // The peer may simply not echo; a failed probe still counts as connected.
        let answered = match channel
            .send(&Command::Ping, self.config.probe_timeout())
            .await
        {
            Ok(response) => {
                info!("Peer answered probe: {}", response);
                true
            }
            Err(e) => {
                warn!("Liveness probe failed ({}), keeping link", e);
                false
            }
        };

        if channel.is_closed() || self.generation.load(Ordering::SeqCst) != started {
            channel.close();
            self.set_state(LinkState::Disconnected);
            return Err(LinkError::LinkDown);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe_answered.store(answered, Ordering::SeqCst);
        *self.channel.write() = Some(channel.clone());
        self.budget.lock().reset();
        self.set_state(LinkState::Connected);
        info!("Connected to {}", peer_id);

        self.spawn_supervisor(channel, generation);
        self.spawn_liveness(generation);
        Ok(())
    }

    /// Close the link. Always lands in `Disconnected` and resets the budget.
    pub fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_reconnect();
        if let Some(task) = self.liveness_task.lock().take() {
            task.abort();
        }
        if let Some(channel) = self.channel.write().take() {
            channel.close();
        }
        self.budget.lock().reset();
        self.set_state(LinkState::Disconnected);
        info!("Disconnected");
    }

    /// Send a command with the configured response timeout.
    pub async fn send(&self, command: &Command) -> LinkResult<String> {
        self.send_with_timeout(command, self.config.response_timeout())
            .await
    }

    /// Send a command if the link is up; `LinkDown` otherwise.
    pub async fn send_with_timeout(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> LinkResult<String> {
        if !self.state().is_connected() {
            return Err(LinkError::LinkDown);
        }
        let channel = self.channel.read().clone().ok_or(LinkError::LinkDown)?;
        channel.send(command, timeout).await
    }

    /// Watch the channel of one connection and react when its read loop ends.
    fn spawn_supervisor(self: &Arc<Self>, channel: Arc<CommandChannel>, generation: u64) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            channel.closed().await;
            drop(channel);
            if let Some(manager) = manager.upgrade() {
                if manager.generation.load(Ordering::SeqCst) == generation {
                    manager.handle_lost();
                }
            }
        });
    }

    fn handle_lost(self: &Arc<Self>) {
        warn!("Link lost");
        self.channel.write().take();
        if let Some(task) = self.liveness_task.lock().take() {
            task.abort();
        }
        self.set_state(LinkState::Lost);
        self.schedule_reconnect();
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            if let Some(manager) = manager.upgrade() {
                manager.reconnect_loop().await;
            }
        });
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let Some(peer_id) = self.peer_id() else {
            self.set_state(LinkState::Disconnected);
            return;
        };
        let generation = self.generation.load(Ordering::SeqCst);

        loop {
            let attempt = {
                let mut budget = self.budget.lock();
                budget.record_attempt().then_some(*budget)
            };
            let Some(budget) = attempt else {
                warn!(
                    "Reconnect attempts exhausted ({}), waiting for an explicit connect",
                    self.config.max_reconnect_attempts
                );
                self.set_state(LinkState::Disconnected);
                return;
            };

            tokio::time::sleep(self.config.reconnect_delay()).await;

            let _guard = self.connect_lock.lock().await;
            if self.state().is_connected() {
                return;
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("Disconnected meanwhile, not reconnecting");
                return;
            }

            info!(
                "Reconnecting to {} (attempt {}/{})",
                peer_id, budget.attempts, budget.max
            );
            match self.establish(&peer_id).await {
                Ok(()) => return,
                Err(e) if !e.is_retriable() => {
                    warn!("Reconnect abandoned: {}", e);
                    return;
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", budget.attempts, e),
            }
        }
    }

    /// Periodically re-probe the peer while this connection lasts.
    fn spawn_liveness(self: &Arc<Self>, generation: u64) {
        let manager = Arc::downgrade(self);
        let period = self.config.liveness_interval().max(Duration::from_secs(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if manager.generation.load(Ordering::SeqCst) != generation {
                    return;
                }

                match manager
                    .send_with_timeout(&Command::Ping, manager.config.probe_timeout())
                    .await
                {
                    Ok(response) => debug!("Liveness probe answered: {}", response),
                    Err(LinkError::AlreadyPending) => debug!("Link busy, skipping probe"),
                    Err(LinkError::Timeout) => warn!("Liveness probe got no answer"),
                    Err(e) => {
                        debug!("Liveness probe stopped: {}", e);
                        return;
                    }
                }
            }
        });

        if let Some(previous) = self.liveness_task.lock().replace(task) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::transport::BoxedStream;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const PEER: &str = "00:11:22:33:44:55";

    /// Opener that hands out duplex streams while `available` is set.
    struct TestOpener {
        opens: AtomicUsize,
        available: parking_lot::Mutex<bool>,
        peers: async_channel::Sender<DuplexStream>,
    }

    impl PeerOpener for TestOpener {
        fn open<'a>(&'a self, peer_id: &'a str) -> BoxFuture<'a, LinkResult<BoxedStream>> {
            async move {
                self.opens.fetch_add(1, Ordering::SeqCst);
                if peer_id != PEER {
                    return Err(LinkError::UnknownPeer(peer_id.to_string()));
                }
                if !*self.available.lock() {
                    return Err(LinkError::Open("host is down".to_string()));
                }
                let (local, remote) = tokio::io::duplex(1024);
                let _ = self.peers.send(remote).await;
                Ok(Box::new(local) as BoxedStream)
            }
            .boxed()
        }
    }

    fn config() -> LinkConfig {
        LinkConfig {
            response_timeout_ms: 100,
            probe_timeout_ms: 50,
            read_timeout_ms: 10,
            reconnect_delay_ms: 10,
            max_reconnect_attempts: 3,
            liveness_interval_secs: 3600,
            contact_sync_delay_ms: 0,
        }
    }

    fn setup() -> (
        Arc<ConnectionManager>,
        Arc<TestOpener>,
        async_channel::Receiver<DuplexStream>,
    ) {
        let (peers_tx, peers_rx) = async_channel::unbounded();
        let opener = Arc::new(TestOpener {
            opens: AtomicUsize::new(0),
            available: parking_lot::Mutex::new(true),
            peers: peers_tx,
        });
        let manager = ConnectionManager::new(opener.clone(), config());
        (manager, opener, peers_rx)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_unknown_peer_stays_disconnected() {
        let (manager, opener, _peers) = setup();

        let result = manager.connect("AA:BB:CC:DD:EE:FF").await;
        assert!(matches!(result, Err(LinkError::UnknownPeer(_))));
        assert_eq!(manager.state(), LinkState::Disconnected);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.state(), LinkState::Disconnected);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silent_peer_still_connects() {
        let (manager, opener, _peers) = setup();

        manager.connect(PEER).await.unwrap();
        assert_eq!(manager.state(), LinkState::Connected);
        assert!(!manager.peer_responding());

        manager.connect(PEER).await.unwrap();
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_answer_and_send() {
        let (manager, _opener, peers) = setup();

        let peer = tokio::spawn(async move {
            let remote = peers.recv().await.unwrap();
            let (reader, mut writer) = tokio::io::split(remote);
            let mut lines = BufReader::new(reader).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                let reply = if line == "PING" { "PONG" } else { "OK" };
                writer
                    .write_all(format!("{}\r\n", reply).as_bytes())
                    .await
                    .unwrap();
            }
        });

        manager.connect(PEER).await.unwrap();
        assert!(manager.peer_responding());
        assert_eq!(manager.send(&Command::Sos).await.unwrap(), "OK");

        manager.disconnect();
        assert_eq!(manager.state(), LinkState::Disconnected);
        assert!(matches!(
            manager.send(&Command::Sos).await,
            Err(LinkError::LinkDown)
        ));
        peer.abort();
    }

    #[tokio::test]
    async fn test_lost_link_reconnects() {
        let (manager, opener, peers) = setup();

        manager.connect(PEER).await.unwrap();
        let first = peers.recv().await.unwrap();
        drop(first);

        wait_until(|| {
            opener.opens.load(Ordering::SeqCst) == 2 && manager.state() == LinkState::Connected
        })
        .await;
        assert_eq!(manager.reconnect_budget().attempts, 0);
    }

    #[tokio::test]
    async fn test_reconnect_budget_is_bounded() {
        let (manager, opener, peers) = setup();

        manager.connect(PEER).await.unwrap();
        let first = peers.recv().await.unwrap();
        *opener.available.lock() = false;
        drop(first);

        wait_until(|| {
            opener.opens.load(Ordering::SeqCst) == 1 + 3
                && manager.state() == LinkState::Disconnected
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(manager.state(), LinkState::Disconnected);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1 + 3);
        let budget = manager.reconnect_budget();
        assert_eq!(budget.attempts, budget.max);

        *opener.available.lock() = true;
        manager.connect(PEER).await.unwrap();
        assert_eq!(manager.state(), LinkState::Connected);
        assert_eq!(manager.reconnect_budget().attempts, 0);
    }

    #[tokio::test]
    async fn test_disconnect_stops_reconnect() {
        let (manager, opener, _peers) = setup();
        *opener.available.lock() = false;

        assert!(manager.connect(PEER).await.is_err());
        manager.disconnect();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.state(), LinkState::Disconnected);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    /// Opener that takes a while and then fails.
    struct SlowOpener {
        opens: AtomicUsize,
    }

    impl PeerOpener for SlowOpener {
        fn open<'a>(&'a self, _peer_id: &'a str) -> BoxFuture<'a, LinkResult<BoxedStream>> {
            async move {
                self.opens.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Err(LinkError::Open("host is down".to_string()))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_prevents_reconnect() {
        let opener = Arc::new(SlowOpener {
            opens: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::new(opener.clone(), config());

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(PEER).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.disconnect();

        assert!(connecting.await.unwrap().is_err());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(manager.state(), LinkState::Disconnected);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.reconnect_budget().attempts, 0);
    }

    #[test]
    fn test_budget_never_exceeds_max() {
        let mut budget = ReconnectBudget::new(2);
        assert!(budget.record_attempt());
        assert!(budget.record_attempt());
        assert!(!budget.record_attempt());
        assert_eq!(budget.attempts, 2);
        assert!(budget.is_exhausted());
        budget.reset();
        assert_eq!(budget.attempts, 0);
    }
}

//! Integration tests for the full emergency flow against a simulated bridge.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use sos_companion::bluetooth::{
    BoxedStream, Command, ConnectionManager, LinkError, LinkResult, PeerOpener,
};
use sos_companion::config::LinkConfig;
use sos_companion::emergency::{
    Collaborators, EmergencyOrchestrator, OrchestratorSettings, StepResult, TriggerOutcome,
    TriggerSource,
};
use sos_companion::events::EventProcessor;
use sos_companion::services::{ConsoleSurface, ContactNotifier, StaticLocationProvider};
use sos_companion::state::{Coordinates, EmergencyPhase, LinkState};

const BRIDGE: &str = "29:50:0E:A7:8A:54";

/// Test side of one simulated bridge connection.
struct Bridge {
    heard: async_channel::Receiver<String>,
    say: async_channel::Sender<String>,
}

impl Bridge {
    async fn expect(&self, line: &str) {
        let heard = tokio::time::timeout(Duration::from_secs(2), self.heard.recv())
            .await
            .expect("bridge heard nothing")
            .unwrap();
        assert_eq!(heard, line);
    }

    async fn say(&self, line: &str) {
        self.say.send(line.to_string()).await.unwrap();
    }
}

/// Bridge loop: records every line, answers `OK`, and writes whatever the
/// test tells it to say. Dropping the `Bridge` hangs up.
fn spawn_bridge(remote: DuplexStream) -> Bridge {
    let (heard_tx, heard) = async_channel::unbounded();
    let (say, say_rx) = async_channel::unbounded::<String>();

    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(remote);
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let _ = heard_tx.send(line.trim_end().to_string()).await;
                        if writer.write_all(b"OK\r\n").await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                },
                out = say_rx.recv() => match out {
                    Ok(line) => {
                        if writer.write_all(format!("{}\r\n", line).as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
    });

    Bridge { heard, say }
}

struct ScriptedOpener {
    opens: AtomicUsize,
    available: AtomicBool,
    bridges: async_channel::Sender<Bridge>,
}

impl PeerOpener for ScriptedOpener {
    fn open<'a>(&'a self, peer_id: &'a str) -> BoxFuture<'a, LinkResult<BoxedStream>> {
        async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if peer_id != BRIDGE {
                return Err(LinkError::UnknownPeer(peer_id.to_string()));
            }
            if !self.available.load(Ordering::SeqCst) {
                return Err(LinkError::Open("host is down".to_string()));
            }
            let (local, remote) = tokio::io::duplex(4096);
            let _ = self.bridges.send(spawn_bridge(remote)).await;
            Ok(Box::new(local) as BoxedStream)
        }
        .boxed()
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl ContactNotifier for RecordingNotifier {
    fn notify_contact(&self, phone: &str, message: &str) -> anyhow::Result<()> {
        self.sent.lock().push((phone.to_string(), message.to_string()));
        Ok(())
    }
}

struct Rig {
    opener: Arc<ScriptedOpener>,
    bridges: async_channel::Receiver<Bridge>,
    link: Arc<ConnectionManager>,
    orchestrator: Arc<EmergencyOrchestrator>,
    notifier: Arc<RecordingNotifier>,
}

fn rig() -> Rig {
    let (bridges_tx, bridges) = async_channel::unbounded();
    let opener = Arc::new(ScriptedOpener {
        opens: AtomicUsize::new(0),
        available: AtomicBool::new(true),
        bridges: bridges_tx,
    });
    let link = ConnectionManager::new(
        opener.clone(),
        LinkConfig {
            response_timeout_ms: 200,
            probe_timeout_ms: 100,
            read_timeout_ms: 10,
            reconnect_delay_ms: 20,
            max_reconnect_attempts: 3,
            liveness_interval_secs: 3600,
            contact_sync_delay_ms: 0,
        },
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let orchestrator = EmergencyOrchestrator::new(
        link.clone(),
        Collaborators {
            location: Arc::new(StaticLocationProvider::new(Some(Coordinates::new(
                12.9, 77.6,
            )))),
            notifier: notifier.clone(),
            surface: Arc::new(ConsoleSurface),
        },
        OrchestratorSettings {
            user_name: "Asha".to_string(),
            contacts: vec!["9876543210".to_string()],
            movement_threshold_deg: 0.0005,
            refresh_interval: Duration::from_secs(3600),
            contact_sync_delay: Duration::ZERO,
        },
    );

    Rig {
        opener,
        bridges,
        link,
        orchestrator,
        notifier,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn wait_for_phase(orchestrator: &EmergencyOrchestrator, phase: EmergencyPhase) {
    let mut session = orchestrator.watch_session();
    tokio::time::timeout(Duration::from_secs(3), session.wait_for(|s| s.phase == phase))
        .await
        .expect("phase not reached")
        .unwrap();
}

#[tokio::test]
async fn test_unknown_peer_stays_disconnected() {
    let rig = rig();

    let result = rig.link.connect("AA:BB:CC:DD:EE:FF").await;
    assert!(matches!(result, Err(LinkError::UnknownPeer(_))));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.link.state(), LinkState::Disconnected);
    assert_eq!(rig.opener.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_location_ack_is_a_response_not_an_event() {
    let rig = rig();
    let (_id, events) = rig.link.subscribe();

    rig.link.connect(BRIDGE).await.unwrap();
    let bridge = rig.bridges.recv().await.unwrap();
    bridge.expect("PING").await;

    let response = rig
        .link
        .send(&Command::Location {
            latitude: 12.9,
            longitude: 77.6,
        })
        .await
        .unwrap();
    bridge.expect("LOC:12.9,77.6").await;
    assert_eq!(response, "OK");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_trigger_without_any_peer_completes() {
    let rig = rig();

    let outcome = rig.orchestrator.trigger(TriggerSource::Manual).await;
    let report = outcome.report().expect("trigger accepted");
    assert!(matches!(report.peer, StepResult::Skipped(_)));
    assert_eq!(report.contacts, vec![("9876543210".to_string(), StepResult::Done)]);

    let sent = rig.notifier.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("https://maps.google.com/?q=12.9,77.6"));
    assert_eq!(rig.orchestrator.phase(), EmergencyPhase::Active);
    assert_eq!(rig.opener.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_triggers_activate_once() {
    let rig = rig();
    let o = &rig.orchestrator;

    let outcomes = tokio::join!(
        o.trigger(TriggerSource::Manual),
        o.trigger(TriggerSource::Voice),
        o.trigger(TriggerSource::Manual),
        o.trigger(TriggerSource::Peer),
    );
    let started = [outcomes.0, outcomes.1, outcomes.2, outcomes.3]
        .iter()
        .filter(|outcome| matches!(outcome, TriggerOutcome::Started(_)))
        .count();

    assert_eq!(started, 1);
    assert_eq!(rig.notifier.sent.lock().len(), 1);
    assert_eq!(rig.orchestrator.phase(), EmergencyPhase::Active);
}

#[tokio::test]
async fn test_hardware_sos_and_cancel() {
    let rig = rig();
    let processor = EventProcessor::new(rig.orchestrator.clone()).spawn();

    rig.link.connect(BRIDGE).await.unwrap();
    let bridge = rig.bridges.recv().await.unwrap();
    bridge.expect("PING").await;
    bridge.expect("CONTACT0:9876543210").await;
    bridge.expect("LOC:12.9,77.6").await;

    bridge.say("SOS_STARTED").await;
    wait_for_phase(&rig.orchestrator, EmergencyPhase::Active).await;
    assert!(rig.orchestrator.session().active);
    bridge.expect("LOC:12.9,77.6").await;
    assert_eq!(rig.notifier.sent.lock().len(), 1);

    bridge.say("SOS_CANCELLED").await;
    wait_for_phase(&rig.orchestrator, EmergencyPhase::Idle).await;
    assert!(!rig.orchestrator.session().active);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.heard.try_recv().is_err());
    processor.abort();
}

#[tokio::test]
async fn test_peer_ready_and_location_request() {
    let rig = rig();
    let processor = EventProcessor::new(rig.orchestrator.clone()).spawn();

    rig.link.connect(BRIDGE).await.unwrap();
    let bridge = rig.bridges.recv().await.unwrap();
    bridge.expect("PING").await;
    bridge.expect("CONTACT0:9876543210").await;
    bridge.expect("LOC:12.9,77.6").await;

    bridge.say("READY").await;
    bridge.expect("CONTACT0:9876543210").await;
    bridge.expect("LOC:12.9,77.6").await;

    bridge.say("LOC_REQ").await;
    bridge.expect("LOC:12.9,77.6").await;
    assert_eq!(rig.orchestrator.phase(), EmergencyPhase::Idle);
    processor.abort();
}

#[tokio::test]
async fn test_reconnect_budget_exhaustion() {
    let rig = rig();

    rig.link.connect(BRIDGE).await.unwrap();
    let bridge = rig.bridges.recv().await.unwrap();
    rig.opener.available.store(false, Ordering::SeqCst);
    drop(bridge);

    wait_until(|| {
        rig.opener.opens.load(Ordering::SeqCst) == 1 + 3
            && rig.link.state() == LinkState::Disconnected
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(rig.link.state(), LinkState::Disconnected);
    assert_eq!(rig.opener.opens.load(Ordering::SeqCst), 1 + 3);
    let budget = rig.link.reconnect_budget();
    assert_eq!(budget.attempts, budget.max);

    let outcome = rig.orchestrator.trigger(TriggerSource::Manual).await;
    assert!(matches!(outcome.report().unwrap().peer, StepResult::Skipped(_)));

    rig.opener.available.store(true, Ordering::SeqCst);
    rig.link.connect(BRIDGE).await.unwrap();
    assert_eq!(rig.link.state(), LinkState::Connected);
    assert_eq!(rig.link.reconnect_budget().attempts, 0);
}

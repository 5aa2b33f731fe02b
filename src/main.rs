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

//! SOS Companion daemon

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sos_companion::bluetooth::{
    BoxedStream, ConnectionManager, LinkError, LinkResult, PeerOpener, RfcommOpener,
};
use sos_companion::config::Config;
use sos_companion::emergency::{
    Collaborators, EmergencyOrchestrator, OrchestratorSettings, StepResult, TriggerOutcome,
    TriggerSource,
};
use sos_companion::events::EventProcessor;
use sos_companion::keywords::KeywordDetector;
use sos_companion::services::{
    CommandNotifier, ConsoleSurface, PanicSignal, StaticLocationProvider,
};

/// Stands in for the RFCOMM opener when BlueZ is unavailable.
struct OfflineOpener {
    reason: String,
}

impl PeerOpener for OfflineOpener {
    fn open<'a>(&'a self, _peer_id: &'a str) -> BoxFuture<'a, LinkResult<BoxedStream>> {
        let reason = self.reason.clone();
        async move { Err(LinkError::Open(reason)) }.boxed()
    }
}

/// Commands accepted on stdin.
enum ConsoleCommand {
    Sos,
    Stop,
    Connect,
    Disconnect,
    Status,
    Say(String),
    Quit,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        match word.to_lowercase().as_str() {
            "sos" => Some(Self::Sos),
            "stop" => Some(Self::Stop),
            "connect" => Some(Self::Connect),
            "disconnect" => Some(Self::Disconnect),
            "status" => Some(Self::Status),
            "say" => Some(Self::Say(rest.trim().to_string())),
            "quit" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

fn config_path_from_args() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                return Ok(Some(PathBuf::from(path)));
            }
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sos_companion=info".parse()?),
        )
        .init();

    info!("Starting SOS Companion v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match config_path_from_args()? {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded");

    let opener: Arc<dyn PeerOpener> = match RfcommOpener::new(&config.peer).await {
        Ok(opener) => Arc::new(opener),
        Err(e) => {
            warn!("Bluetooth unavailable ({}), running without the bridge", e);
            Arc::new(OfflineOpener {
                reason: e.to_string(),
            })
        }
    };
    let link = ConnectionManager::new(opener, config.link.clone());

    let settings = OrchestratorSettings::from_config(&config);
    if settings.contacts.is_empty() {
        warn!("No valid emergency contacts configured");
    }
    let orchestrator = EmergencyOrchestrator::new(
        link.clone(),
        Collaborators {
            location: Arc::new(StaticLocationProvider::new(config.location.fixed_position())),
            notifier: Arc::new(CommandNotifier::new(config.profile.notify_command.clone())),
            surface: Arc::new(ConsoleSurface),
        },
        settings,
    );

    let detector = KeywordDetector::new(&config.voice.keywords);
    let panic_task = orchestrator.attach_panic_source(detector.cues());
    let events_task = EventProcessor::new(orchestrator.clone()).spawn();
    let refresh_task = orchestrator.spawn_location_refresh();

    let address = config.peer.address.clone();
    if config.peer.auto_connect {
        let link = link.clone();
        let address = address.clone();
        tokio::spawn(async move {
            if let Err(e) = link.connect(&address).await {
                warn!("Initial connect failed: {}", e);
            }
        });
    }

    info!("Ready. Commands: sos, stop, connect, disconnect, status, say <text>, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Console closed, waiting for Ctrl-C");
                        stdin_open = false;
                        continue;
                    }
                    Err(e) => {
                        error!("Console read failed: {}", e);
                        stdin_open = false;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match ConsoleCommand::parse(&line) {
                    Some(ConsoleCommand::Sos) => {
                        let orchestrator = orchestrator.clone();
                        tokio::spawn(async move {
                            match orchestrator.trigger(TriggerSource::Manual).await {
                                TriggerOutcome::Started(report) => info!(
                                    "SOS sent: location {:?}, peer {:?}, {} contact(s) notified",
                                    report.location,
                                    report.peer,
                                    report
                                        .contacts
                                        .iter()
                                        .filter(|(_, r)| *r == StepResult::Done)
                                        .count()
                                ),
                                TriggerOutcome::Ignored(phase) => {
                                    info!("Emergency already {}", phase.as_str())
                                }
                            }
                        });
                    }
                    Some(ConsoleCommand::Stop) => {
                        if !orchestrator.stop().await {
                            info!("No emergency running");
                        }
                    }
                    Some(ConsoleCommand::Connect) => {
                        let link = link.clone();
                        let address = address.clone();
                        tokio::spawn(async move {
                            if let Err(e) = link.connect(&address).await {
                                warn!("Connect failed: {}", e);
                            }
                        });
                    }
                    Some(ConsoleCommand::Disconnect) => link.disconnect(),
                    Some(ConsoleCommand::Status) => {
                        let session = orchestrator.session();
                        let budget = link.reconnect_budget();
                        info!(
                            "Link: {} (reconnects {}/{}), emergency: {}, peer: {}",
                            link.state().as_str(),
                            budget.attempts,
                            budget.max,
                            session.phase.as_str(),
                            orchestrator.status()
                        );
                        if budget.is_exhausted() && !link.state().is_connected() {
                            info!("Reconnect attempts used up, type 'connect' to retry");
                        }
                        if let Some(fix) = session.last_known_location {
                            info!("Last known location: {}", fix.map_link());
                        }
                    }
                    Some(ConsoleCommand::Say(text)) => {
                        detector.feed(&text);
                    }
                    Some(ConsoleCommand::Quit) => {
                        info!("Quit requested");
                        break;
                    }
                    None => warn!("Unknown command: {}", line.trim()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    panic_task.abort();
    refresh_task.abort();
    events_task.abort();
    link.disconnect();

    info!("SOS Companion stopped");
    Ok(())
}

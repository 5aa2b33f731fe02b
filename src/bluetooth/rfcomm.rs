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

//! RFCOMM client for the serial bridge, via BlueZ.

use anyhow::Result;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, Address, Session};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tracing::{debug, info};

use super::error::{LinkError, LinkResult};
use super::transport::{BoxedStream, PeerOpener};
use crate::config::PeerConfig;

/// Opens RFCOMM streams to paired devices on the default adapter.
pub struct RfcommOpener {
    _session: Session,
    adapter: Adapter,
    channel: u8,
    connect_timeout: Duration,
}

impl RfcommOpener {
    /// Attach to BlueZ and power the default adapter on if needed.
    pub async fn new(config: &PeerConfig) -> Result<Self> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            _session: session,
            adapter,
            channel: config.channel,
            connect_timeout: config.connect_timeout(),
        })
    }

    async fn open_stream(&self, peer_id: &str) -> LinkResult<BoxedStream> {
        let address: Address = peer_id
            .parse()
            .map_err(|_| LinkError::UnknownPeer(peer_id.to_string()))?;

        let device = self
            .adapter
            .device(address)
            .map_err(|e| LinkError::UnknownPeer(format!("{}: {}", peer_id, e)))?;
        match device.is_paired().await {
            Ok(true) => {}
            Ok(false) => return Err(LinkError::UnknownPeer(format!("{} is not paired", peer_id))),
            Err(e) => return Err(LinkError::UnknownPeer(format!("{}: {}", peer_id, e))),
        }

        debug!("Opening RFCOMM channel {} on {}", self.channel, address);
        let target = SocketAddr::new(address, self.channel);
        let stream = tokio::time::timeout(self.connect_timeout, Stream::connect(target))
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(|e| LinkError::Open(e.to_string()))?;

        Ok(Box::new(stream) as BoxedStream)
    }
}

impl PeerOpener for RfcommOpener {
    fn open<'a>(&'a self, peer_id: &'a str) -> BoxFuture<'a, LinkResult<BoxedStream>> {
        self.open_stream(peer_id).boxed()
    }
}

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

//! Bluetooth communication module.
//!
//! Serial link to the SOS bridge: transport, command channel, connection
//! lifecycle and the RFCOMM opener.

mod channel;
mod error;
mod manager;
mod protocol;
mod rfcomm;
mod transport;

pub use channel::{CommandChannel, EventBus, SubscriptionId};
pub use error::{LinkError, LinkResult};
pub use manager::{ConnectionManager, ReconnectBudget};
pub use protocol::{
    Command, EventKind, EventPayload, UnsolicitedEvent, LINE_TERMINATOR, MAX_CONTACT_SLOTS,
};
pub use rfcomm::RfcommOpener;
pub use transport::{
    BoxedStream, CloseHandle, PeerOpener, PeerStream, ReadOutcome, SerialTransport,
    TransportReader, TransportWriter,
};

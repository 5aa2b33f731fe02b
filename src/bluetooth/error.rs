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

//! Error types for the serial link.

use thiserror::Error;

/// Errors surfaced by the transport, command channel and connection manager.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Stream-level failure. Always fatal to the current connection.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The peer did not answer in time.
    #[error("timed out waiting for peer")]
    Timeout,

    /// A command is already outstanding on the link.
    #[error("a command is already pending")]
    AlreadyPending,

    /// The link is not connected.
    #[error("link is down")]
    LinkDown,

    /// The peer identifier is unknown or not paired. Never retried.
    #[error("unknown or unpaired peer: {0}")]
    UnknownPeer(String),

    /// Opening the stream failed for another reason.
    #[error("failed to open stream: {0}")]
    Open(String),
}

impl LinkError {
    /// Whether a failed connect with this error should feed the reconnect loop.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, LinkError::UnknownPeer(_))
    }
}

/// Result type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

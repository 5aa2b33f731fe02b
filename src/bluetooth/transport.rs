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

//! Byte-level serial transport over one open stream.
//!
//! The transport knows nothing about commands. It reads terminated lines
//! with a timeout, writes and flushes raw bytes, and can be closed from any
//! task, which unblocks a reader waiting on the stream.

use futures::future::BoxFuture;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::error::{LinkError, LinkResult};

/// Longest line accepted from the peer; longer lines are dropped whole.
const MAX_LINE_LEN: usize = 1024;

/// Any duplex byte stream usable as a peer link.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Type-erased peer stream.
pub type BoxedStream = Box<dyn PeerStream>;

/// Opens a byte stream to a named, already-paired peer.
pub trait PeerOpener: Send + Sync {
    fn open<'a>(&'a self, peer_id: &'a str) -> BoxFuture<'a, LinkResult<BoxedStream>>;
}

/// Result of a single line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete, non-empty line without its terminator.
    Line(String),
    /// Nothing complete arrived before the timeout. Normal when the peer is silent.
    Timeout,
}

/// Serial transport owning one open stream.
pub struct SerialTransport {
    reader: TransportReader,
    writer: TransportWriter,
}

impl SerialTransport {
    /// Wrap an open stream.
    pub fn new(stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed_tx, closed_rx) = watch::channel(false);
        let closer = CloseHandle {
            closed: Arc::new(closed_tx),
        };

        Self {
            reader: TransportReader {
                inner: BufReader::new(read_half),
                closed: closed_rx,
            },
            writer: TransportWriter {
                inner: write_half,
                closer,
            },
        }
    }

    /// Handle that closes the transport from any task.
    pub fn close_handle(&self) -> CloseHandle {
        self.writer.closer.clone()
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }
}

/// Idempotent close switch shared by both halves.
#[derive(Clone)]
pub struct CloseHandle {
    closed: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    /// Mark the transport closed. Safe to call repeatedly and from any state.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Transport closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

fn closed_error() -> LinkError {
    LinkError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "transport closed",
    ))
}

/// Read half of the transport.
pub struct TransportReader {
    inner: BufReader<ReadHalf<BoxedStream>>,
    closed: watch::Receiver<bool>,
}

impl TransportReader {
    /// Read one line terminated by `\n` or `\r`.
    ///
    /// A partial line still unterminated when `timeout` elapses is dropped;
    /// nothing carries over into the next call.
    pub async fn read_line(&mut self, timeout: Duration) -> LinkResult<ReadOutcome> {
        if *self.closed.borrow() {
            return Err(closed_error());
        }

        let mut closed = self.closed.clone();
        let inner = &mut self.inner;

        tokio::select! {
            result = tokio::time::timeout(timeout, read_terminated(inner)) => match result {
                Ok(Ok(line)) => Ok(ReadOutcome::Line(line)),
                Ok(Err(e)) => Err(LinkError::Io(e)),
                Err(_) => Ok(ReadOutcome::Timeout),
            },
            _ = closed.wait_for(|closed| *closed) => Err(closed_error()),
        }
    }
}

async fn read_terminated<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut line = Vec::new();
    let mut overlong = false;

    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the stream",
                ));
            }
            Err(e) => return Err(e),
        };

        if byte == b'\n' || byte == b'\r' {
            if overlong {
                warn!("Dropped a line longer than {} bytes", MAX_LINE_LEN);
                overlong = false;
                continue;
            }
            // Skip the empty line produced by the second half of "\r\n".
            if line.is_empty() {
                continue;
            }
            break;
        }

        if overlong {
            continue;
        }
        line.push(byte);
        if line.len() > MAX_LINE_LEN {
            line.clear();
            overlong = true;
        }
    }

    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

/// Write half of the transport.
pub struct TransportWriter {
    inner: WriteHalf<BoxedStream>,
    closer: CloseHandle,
}

impl TransportWriter {
    /// Write and flush. Any failure means the link must be treated as dead.
    pub async fn write(&mut self, bytes: &[u8]) -> LinkResult<()> {
        if self.closer.is_closed() {
            return Err(closed_error());
        }

        let mut closed = self.closer.closed.subscribe();
        let inner = &mut self.inner;

        tokio::select! {
            result = async {
                inner.write_all(bytes).await?;
                inner.flush().await
            } => result.map_err(LinkError::Io),
            _ = closed.wait_for(|closed| *closed) => Err(closed_error()),
        }
    }

    /// Close the transport and shut the write side down.
    pub async fn close(&mut self) {
        self.closer.close();
        let _ = self.inner.shutdown().await;
    }
}

//! One tunneled TCP connection on the relay.
//!
//! A dedicated reader task turns the blocking remote read into a channel the
//! poll handler can race against its timeout. The poll lock owns both the
//! channel receiver and the adaptive timeout, so two polls for the same
//! session are served one after the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{SessionId, DEFAULT_POLL_MAX, DEFAULT_POLL_MIN};

/// Chunks buffered between the reader task and the next poll.
const OUTPUT_CHANNEL_CAPACITY: usize = 32;
/// Upper bound on bytes coalesced into one poll response.
const MAX_POLL_BYTES: usize = 1024 * 1024;

/// Bounds of the adaptive poll wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub min: Duration,
    pub max: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            min: DEFAULT_POLL_MIN,
            max: DEFAULT_POLL_MAX,
        }
    }
}

/// Result of waiting on a session's output
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Remote bytes, in the order they were read
    Data(Bytes),
    /// Nothing arrived within the current timeout
    Idle,
    /// The remote side is finished and everything buffered has been delivered
    Closed,
}

struct PollState {
    output: mpsc::Receiver<Bytes>,
    timeout: Duration,
}

pub struct Session {
    id: SessionId,
    host: String,
    writer: Mutex<OwnedWriteHalf>,
    poll: Mutex<PollState>,
    settings: PollSettings,
    close: CancellationToken,
    created: Instant,
    /// Milliseconds after `created` of the last push or poll
    last_seen_ms: AtomicU64,
}

impl Session {
    /// Wrap a connected stream and start its reader task
    pub fn spawn(
        id: SessionId,
        host: String,
        stream: TcpStream,
        buffer_size: usize,
        settings: PollSettings,
    ) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let close = CancellationToken::new();

        tokio::spawn(read_remote(
            id.clone(),
            reader,
            output_tx,
            close.clone(),
            buffer_size.max(1),
        ));

        Arc::new(Self {
            id,
            host,
            writer: Mutex::new(writer),
            poll: Mutex::new(PollState {
                output: output_rx,
                timeout: settings.min,
            }),
            settings,
            close,
            created: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Write client bytes to the remote socket
    pub async fn push(&self, data: &[u8]) -> std::io::Result<()> {
        self.touch();
        if self.is_closed() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Wait up to the current poll timeout for remote bytes.
    ///
    /// Delivery resets the timeout to the minimum; an empty wait doubles it,
    /// capped at the maximum.
    pub async fn poll(&self) -> PollOutcome {
        self.touch();
        let mut state = self.poll.lock().await;
        let wait = state.timeout;

        match tokio::time::timeout(wait, state.output.recv()).await {
            Ok(Some(first)) => {
                let mut data = BytesMut::from(&first[..]);
                while data.len() < MAX_POLL_BYTES {
                    match state.output.try_recv() {
                        Ok(more) => data.extend_from_slice(&more),
                        Err(_) => break,
                    }
                }
                state.timeout = self.settings.min;
                PollOutcome::Data(data.freeze())
            }
            Ok(None) => PollOutcome::Closed,
            Err(_) => {
                state.timeout = (wait * 2).min(self.settings.max);
                PollOutcome::Idle
            }
        }
    }

    /// Wait the next poll will use
    pub async fn poll_timeout(&self) -> Duration {
        self.poll.lock().await.timeout
    }

    /// Time since the client last pushed or polled
    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last_seen)
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Stop the reader task. Idempotent and never blocks.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

async fn read_remote(
    id: SessionId,
    mut reader: OwnedReadHalf,
    output: mpsc::Sender<Bytes>,
    close: CancellationToken,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let read = tokio::select! {
            _ = close.cancelled() => {
                debug!("Session {} closed locally, stopping reader", id);
                break;
            }
            read = reader.read(&mut buf) => read,
        };

        let chunk = match read {
            Ok(0) => {
                debug!("Session {} remote closed", id);
                break;
            }
            Ok(n) => Bytes::copy_from_slice(&buf[..n]),
            Err(e) => {
                debug!("Session {} remote read error: {}", id, e);
                break;
            }
        };

        tokio::select! {
            _ = close.cancelled() => break,
            sent = output.send(chunk) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    // Dropping `output` closes the channel; dropping `reader` releases our
    // half of the socket.
}

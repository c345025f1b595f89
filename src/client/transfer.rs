//! Relay mode for a tunneled local connection.
//!
//! Local bytes go out as poll bodies, remote bytes come back in poll
//! responses. Exactly one poll is in flight per tunnel; when the local side
//! is quiet an empty poll is sent every poll interval.

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::TunnelClient;
use crate::error::TunnelError;
use crate::protocol::SessionId;

const CHANNEL_CAPACITY: usize = 32;

enum Ending {
    /// Local application closed or stopped accepting data
    Local,
    /// The relay already dropped the session
    Gone(StatusCode),
    Failed(TunnelError),
}

pub(super) async fn relay(client: &TunnelClient, stream: TcpStream, id: SessionId, leftover: Bytes) {
    let buffer_size = client.settings().buffer_size.max(1);
    let poll_interval = client.settings().poll_interval;
    let (mut read_half, mut write_half) = stream.into_split();

    // Channel for data from local to relay
    let (push_tx, mut push_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    // Channel for data from relay to local
    let (pull_tx, mut pull_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    if !leftover.is_empty() {
        let _ = push_tx.send(leftover).await;
    }

    let reader_id = id.clone();
    let read_task = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(buffer_size);
        loop {
            buf.reserve(buffer_size);
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("Tunnel {} local side closed", reader_id);
                    break;
                }
                Ok(_) => {
                    if push_tx.send(buf.split().freeze()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Tunnel {} local read error: {}", reader_id, e);
                    break;
                }
            }
        }
    });

    let write_task = tokio::spawn(async move {
        while let Some(data) = pull_rx.recv().await {
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let ending = loop {
        let push = tokio::select! {
            biased;
            chunk = push_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break Ending::Local,
            },
            _ = tokio::time::sleep(poll_interval) => Bytes::new(),
        };

        match client.poll(&id, push).await {
            Ok(data) if data.is_empty() => {}
            Ok(data) => {
                if pull_tx.send(data).await.is_err() {
                    break Ending::Local;
                }
            }
            Err(TunnelError::Status(status))
                if status == StatusCode::GONE || status == StatusCode::SERVICE_UNAVAILABLE =>
            {
                break Ending::Gone(status);
            }
            Err(e) => break Ending::Failed(e),
        }
    };

    match ending {
        Ending::Local => {
            info!("Tunnel {} closed locally", id);
            client.disconnect(&id).await;
        }
        Ending::Gone(status) => info!("Tunnel {} closed by relay ({})", id, status),
        Ending::Failed(e) => {
            warn!("Tunnel {} failed: {}", id, e);
            client.disconnect(&id).await;
        }
    }

    // Let the writer flush what the relay already delivered, then release the socket.
    drop(pull_tx);
    let _ = write_task.await;
    read_task.abort();
}

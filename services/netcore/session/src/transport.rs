//! TCP transport tasks.
//!
//! Each connection is split into a reader task and a writer task. Neither
//! task touches session state; they report bytes and failures to the
//! engine as [`EngineEvent`]s tagged with the connection generation.
//!
//! Readers post on a bounded channel and wait when it is full, so a fast
//! peer cannot run ahead of the engine.

use bytes::{Bytes, BytesMut};
use netcore_wire::{AccepterId, SessionId};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::handle::InFlight;
use crate::manager::EngineEvent;
use crate::session::CloseReason;

/// Read size per socket read
const READ_CHUNK: usize = 16 * 1024;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind a TCP listener
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a remote TCP endpoint
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Accept connections forever, forwarding each to the engine
pub(crate) fn spawn_accept_loop(
    accepter: AccepterId,
    listener: TcpListener,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    trace!("Accepter {} got connection from {}", accepter, peer);
                    if events
                        .send(EngineEvent::Accepted {
                            accepter,
                            stream,
                            peer,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Accepter {} accept failed: {}", accepter, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!("Accepter {} loop ended", accepter);
    })
}

/// Run one outbound connect attempt
pub(crate) fn spawn_connect(
    id: SessionId,
    generation: u64,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = match connect_tcp(addr).await {
            Ok(stream) => EngineEvent::Connected {
                id,
                generation,
                stream,
            },
            Err(e) => EngineEvent::ConnectFailed {
                id,
                generation,
                error: e.to_string(),
            },
        };
        let _ = events.send(event);
    })
}

/// Forward everything read from the socket to the engine
pub(crate) fn spawn_reader(
    mut half: OwnedReadHalf,
    id: SessionId,
    generation: u64,
    events: mpsc::Sender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            let reason = match half.read_buf(&mut buf).await {
                Ok(0) => CloseReason::PeerClosed,
                Ok(n) => {
                    trace!("Session {} read {} bytes", id, n);
                    let data = buf.split().freeze();
                    if events
                        .send(EngineEvent::Data {
                            id,
                            generation,
                            data,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    continue;
                }
                Err(e) => CloseReason::Io(e.to_string()),
            };
            let _ = events
                .send(EngineEvent::Closed {
                    id,
                    generation,
                    reason,
                })
                .await;
            return;
        }
    })
}

/// Write queued bytes in order; drains and shuts down once the sender drops.
///
/// On a write error the writer stops taking units. Whatever it had not
/// written stays with `in_flight` for the engine to requeue or discard.
pub(crate) fn spawn_writer(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    in_flight: InFlight,
    id: SessionId,
    generation: u64,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = half.write_all(&data).await {
                rx.close();
                debug!("Session {} write failed with {} bytes unwritten", id, in_flight.held());
                let _ = events.send(EngineEvent::Closed {
                    id,
                    generation,
                    reason: CloseReason::Io(e.to_string()),
                });
                return;
            }
            in_flight.written();
        }
        let _ = half.shutdown().await;
    })
}

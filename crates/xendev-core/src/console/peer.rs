//! Terminal connections attached to a console.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::controller::InstanceKey;
use crate::event_loop::{ConsoleEvent, LoopEvent, LoopSender};

/// Identifies one accepted terminal connection.
pub type PeerId = u64;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique peer id.
#[must_use]
pub fn next_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A terminal-side connection a console can write to and close.
///
/// Writes never block the event loop: an implementation either accepts bytes
/// immediately or reports how many it took.
pub trait ConsolePeer: Send + fmt::Debug {
    /// Connection id.
    fn id(&self) -> PeerId;

    /// Remote address.
    fn addr(&self) -> SocketAddr;

    /// Writes as much of `data` as possible, returning the accepted count.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Flushes what was accepted and closes the connection.
    fn close(&mut self);
}

const READ_BUFFER_SIZE: usize = 1024;

/// A TCP terminal served by a reader task and a writer task.
///
/// The reader posts [`ConsoleEvent::Input`] and finally
/// [`ConsoleEvent::Hangup`] to the event loop; the writer drains an
/// unbounded queue fed by [`ConsolePeer::write`].
pub struct TcpPeer {
    id: PeerId,
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl TcpPeer {
    /// Hands an accepted stream to the event loop of console `key`.
    ///
    /// The peer is queued as [`ConsoleEvent::Accepted`] before its reader
    /// starts, so the loop never sees input from a peer it does not know yet.
    /// Returns false if the loop has stopped. Must be called within a tokio
    /// runtime.
    pub fn accept(stream: TcpStream, addr: SocketAddr, key: InstanceKey, events: &LoopSender) -> bool {
        let id = next_peer_id();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (reader, writer) = stream.into_split();
        tokio::spawn(write_loop(writer, rx, cancel.clone()));

        let peer = Self {
            id,
            addr,
            tx,
            cancel: cancel.clone(),
        };
        let event = ConsoleEvent::Accepted(Box::new(peer));
        if events.send(LoopEvent::Console { key, event }).is_err() {
            cancel.cancel();
            return false;
        }
        tokio::spawn(read_loop(reader, id, key, events.clone(), cancel));
        true
    }
}

impl fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPeer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ConsolePeer for TcpPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
        }
        self.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer writer stopped"))?;
        Ok(data.len())
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    peer: PeerId,
    key: InstanceKey,
    events: LoopSender,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    let event = ConsoleEvent::Input {
                        peer,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if events.send(LoopEvent::Console { key, event }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer, error = %e, "console peer read failed");
                    break;
                }
            },
        }
    }
    let _ = events.send(LoopEvent::Console {
        key,
        event: ConsoleEvent::Hangup { peer },
    });
}

async fn write_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(chunk) => {
                    if let Err(e) = writer.write_all(&chunk).await {
                        tracing::debug!(error = %e, "console peer write failed");
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
            () = cancel.cancelled() => {
                while let Ok(chunk) = rx.try_recv() {
                    if writer.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

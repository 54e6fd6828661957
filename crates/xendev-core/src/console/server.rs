//! TCP listeners for console terminals.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::console::peer::TcpPeer;
use crate::controller::InstanceKey;
use crate::event_loop::LoopSender;

/// A running accept loop; stopping it closes the listening socket.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Binds `addr` and starts accepting terminals for the console `key`.
    ///
    /// Every accepted connection is posted to the event loop as
    /// [`ConsoleEvent::Accepted`](crate::event_loop::ConsoleEvent::Accepted);
    /// the console decides whether to keep it.
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub fn bind(addr: SocketAddr, key: InstanceKey, events: LoopSender) -> io::Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, key, events, cancel.clone()));
        tracing::info!(%key, %local_addr, "console listening");

        Ok(Self {
            local_addr: Some(local_addr),
            cancel,
            task: Some(task),
        })
    }

    /// A handle with no socket behind it.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            local_addr: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Bound address, if backed by a socket.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns true until [`stop`](Self::stop) is called.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops accepting and closes the socket.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    key: InstanceKey,
    events: LoopSender,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(%key, %addr, "console connection accepted");
                    if !TcpPeer::accept(stream, addr, key, &events) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "console accept failed");
                }
            },
        }
    }
    tracing::debug!(%key, "console listener stopped");
}

//! Console event loop.
//!
//! All console state lives on one task. Socket tasks, channel signal
//! handlers and callers post [`LoopEvent`]s; the loop applies each one to
//! completion before taking the next, so handlers never interleave.

use std::fmt;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use xendev_channel::ChannelSignal;
use xendev_error::CommonError;

use crate::config::ConsoleSettings;
use crate::console::{ConsoleControllerFactory, ConsolePeer, PeerId};
use crate::controller::InstanceKey;
use crate::error::{CoreError, Result};
use crate::event::EventBus;

/// Sender half of the loop queue.
pub type LoopSender = mpsc::UnboundedSender<LoopEvent>;

/// Work applied on the loop with exclusive access to the consoles.
pub type LoopCall = Box<dyn FnOnce(&mut ConsoleControllerFactory) + Send>;

/// Terminal-side events.
#[derive(Debug)]
pub enum ConsoleEvent {
    /// A terminal connected.
    Accepted(Box<dyn ConsolePeer>),
    /// A terminal sent bytes.
    Input { peer: PeerId, data: Bytes },
    /// A terminal went away.
    Hangup { peer: PeerId },
}

/// Everything the loop reacts to.
pub enum LoopEvent {
    /// Readiness change on a console channel.
    Channel {
        key: InstanceKey,
        signal: ChannelSignal,
    },
    /// Terminal activity.
    Console { key: InstanceKey, event: ConsoleEvent },
    /// Caller work, see [`LoopHandle::call`].
    Call(LoopCall),
    /// Close every console and stop.
    Shutdown,
}

impl fmt::Debug for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel { key, signal } => f
                .debug_struct("Channel")
                .field("key", key)
                .field("signal", signal)
                .finish(),
            Self::Console { key, event } => f
                .debug_struct("Console")
                .field("key", key)
                .field("event", event)
                .finish(),
            Self::Call(_) => f.write_str("Call"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// The console event loop.
#[derive(Debug)]
pub struct EventLoop {
    consoles: ConsoleControllerFactory,
    event_tx: LoopSender,
    event_rx: mpsc::UnboundedReceiver<LoopEvent>,
}

impl EventLoop {
    /// Creates a loop with no consoles.
    #[must_use]
    pub fn new(settings: ConsoleSettings, events: EventBus) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            consoles: ConsoleControllerFactory::new(settings, events, event_tx.clone()),
            event_tx,
            event_rx,
        }
    }

    /// Returns a handle for posting work to the loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.event_tx.clone(),
        }
    }

    /// Consoles, for use before the loop is started.
    pub fn consoles_mut(&mut self) -> &mut ConsoleControllerFactory {
        &mut self.consoles
    }

    /// Applies one event. Returns false on [`LoopEvent::Shutdown`].
    pub fn handle_event(&mut self, event: LoopEvent) -> bool {
        match event {
            LoopEvent::Channel { key, signal } => self.consoles.channel_signal(key, signal),
            LoopEvent::Console { key, event } => match event {
                ConsoleEvent::Accepted(peer) => self.consoles.peer_accepted(key, peer),
                ConsoleEvent::Input { peer, data } => self.consoles.peer_input(key, peer, &data),
                ConsoleEvent::Hangup { peer } => self.consoles.peer_hangup(key, peer),
            },
            LoopEvent::Call(call) => call(&mut self.consoles),
            LoopEvent::Shutdown => return false,
        }
        true
    }

    /// Applies every event already queued without waiting.
    ///
    /// Returns false if a shutdown was among them.
    pub fn run_pending(&mut self) -> bool {
        while let Ok(event) = self.event_rx.try_recv() {
            if !self.handle_event(event) {
                return false;
            }
        }
        true
    }

    /// Runs until [`LoopHandle::shutdown`], then closes every console.
    pub async fn run(mut self) {
        tracing::debug!("console event loop started");
        while let Some(event) = self.event_rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        self.consoles.close_all();
        tracing::debug!("console event loop stopped");
    }
}

/// Cloneable handle to a running [`EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopHandle {
    tx: LoopSender,
}

impl LoopHandle {
    /// Runs `f` on the loop and returns its result.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error if the loop has stopped.
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ConsoleControllerFactory) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LoopEvent::Call(Box::new(move |consoles: &mut ConsoleControllerFactory| {
                let _ = reply_tx.send(f(consoles));
            })))
            .map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())
    }

    /// Raw sender, for socket tasks and signal handlers.
    #[must_use]
    pub fn sender(&self) -> LoopSender {
        self.tx.clone()
    }

    /// Asks the loop to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopEvent::Shutdown);
    }
}

fn stopped() -> CoreError {
    CommonError::invalid_state("console event loop stopped").into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::tests::FakePeer;
    use crate::console::ConsoleState;
    use xendev_channel::{Message, MemoryChannel};

    fn local_settings() -> ConsoleSettings {
        ConsoleSettings {
            bind_address: "127.0.0.1".to_string(),
            ..ConsoleSettings::default()
        }
    }

    #[tokio::test]
    async fn test_run_pending_applies_events_in_order() {
        let mut event_loop = EventLoop::new(local_settings(), EventBus::new());
        let (channel, guest) = MemoryChannel::pair(4);
        event_loop
            .consoles_mut()
            .create_console(1, Box::new(channel), Some(0))
            .unwrap();

        let peer = FakePeer::new(7001);
        let key = InstanceKey::domain(1);
        event_loop.handle_event(LoopEvent::Console {
            key,
            event: ConsoleEvent::Accepted(Box::new(peer.clone())),
        });

        guest.send_request(Message::console_data(&b"one "[..]).unwrap());
        guest.send_request(Message::console_data(&b"two"[..]).unwrap());
        assert!(event_loop.run_pending());
        assert_eq!(peer.received(), b"one two");

        event_loop.handle_event(LoopEvent::Console {
            key,
            event: ConsoleEvent::Input {
                peer: peer.id,
                data: Bytes::from_static(b"reply"),
            },
        });
        assert_eq!(guest.take_sent()[0].payload().as_ref(), b"reply");
    }

    #[tokio::test]
    async fn test_shutdown_stops_and_closes() {
        let mut event_loop = EventLoop::new(local_settings(), EventBus::new());
        let (channel, guest) = MemoryChannel::pair(4);
        event_loop
            .consoles_mut()
            .create_console(2, Box::new(channel), Some(0))
            .unwrap();
        let handle = event_loop.handle();

        let task = tokio::spawn(event_loop.run());
        let state = handle
            .call(|consoles| consoles.lookup(2).map(|c| c.state()))
            .await
            .unwrap();
        assert_eq!(state, Some(ConsoleState::Listening));

        handle.shutdown();
        task.await.unwrap();
        assert!(guest.is_closed());
        assert!(handle.call(|consoles| consoles.len()).await.is_err());
    }
}

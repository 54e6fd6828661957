//! Console bridge.
//!
//! A [`ConsoleController`] joins one guest console channel to at most one
//! terminal connected over TCP:
//!
//! ```text
//!                  read_buf (bounded)
//!   guest ── Channel ────────────────▶ handle_output ──▶ terminal
//!         ◀── produce_requests ◀──────────────────────── handle_input
//!                  write_buf (unbounded, drained while write-ready)
//! ```
//!
//! State machine:
//!
//! ```text
//!   New ──listen──▶ Listening ──connect──▶ Connected
//!                       ▲                      │
//!                       └─disconnect / hangup──┘
//!   (any) ──lost_channel──▶ Closed
//! ```

pub mod factory;
pub mod peer;
pub mod ring;
pub mod server;

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;
use xendev_channel::{Channel, ChannelPorts, MajorType, Message, MessageType, MAX_PAYLOAD};
use xendev_error::CommonError;

use crate::config::ConsoleSettings;
use crate::controller::{Controller, Dispatch, InstanceKey};
use crate::error::{CoreError, Result};
use crate::event::{Event, EventBus};

pub use factory::ConsoleControllerFactory;
pub use peer::{ConsolePeer, PeerId, TcpPeer};
pub use ring::ByteRing;
pub use server::ListenerHandle;

/// Console lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleState {
    /// Created, not yet accepting terminals.
    New,
    /// Accepting a terminal.
    Listening,
    /// A terminal is attached.
    Connected,
    /// The channel is gone. Terminal state.
    Closed,
}

impl fmt::Display for ConsoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Listening => "listening",
            Self::Connected => "connected",
            Self::Closed => "closed",
        })
    }
}

/// A refused [`ConsoleController::connect`]; hands the peer back so the
/// caller can tell it why before closing it.
#[derive(Debug)]
pub struct ConnectRejected {
    /// Console that refused.
    pub console: u32,
    /// State at the time of the attempt.
    pub state: ConsoleState,
    /// The refused peer, still open.
    pub peer: Box<dyn ConsolePeer>,
}

impl From<ConnectRejected> for CoreError {
    fn from(rejected: ConnectRejected) -> Self {
        Self::Rejected {
            console: rejected.console,
            state: rejected.state,
        }
    }
}

/// Serializable console summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleInfo {
    pub status: ConsoleState,
    pub id: u32,
    pub domain: u32,
    pub console_port: u16,
    /// Channel port in the control domain.
    pub local_port: u32,
    /// Channel port in the guest.
    pub remote_port: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<SocketAddr>,
}

/// Bridges one guest console channel to one terminal.
#[derive(Debug)]
pub struct ConsoleController {
    id: u32,
    domid: u32,
    port: u16,
    state: ConsoleState,
    ports: ChannelPorts,
    channel: Option<Box<dyn Channel>>,
    listener: Option<ListenerHandle>,
    peer: Option<Box<dyn ConsolePeer>>,
    read_buf: ByteRing,
    write_buf: ByteRing,
    output_chunk: usize,
    events: EventBus,
}

impl ConsoleController {
    /// Creates a console in state [`ConsoleState::New`].
    #[must_use]
    pub fn new(
        id: u32,
        domid: u32,
        port: u16,
        channel: Box<dyn Channel>,
        settings: &ConsoleSettings,
        events: EventBus,
    ) -> Self {
        Self {
            id,
            domid,
            port,
            state: ConsoleState::New,
            ports: channel.ports(),
            channel: Some(channel),
            listener: None,
            peer: None,
            read_buf: ByteRing::with_limit(settings.read_buffer_limit),
            write_buf: ByteRing::new(),
            output_chunk: settings.output_chunk.max(1),
            events,
        }
    }

    /// Console id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Owning domain.
    #[must_use]
    pub const fn domid(&self) -> u32 {
        self.domid
    }

    /// TCP port terminals connect to.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConsoleState {
        self.state
    }

    /// Address of the attached terminal.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.as_ref().map(|peer| peer.addr())
    }

    /// Guest output waiting for a terminal.
    #[must_use]
    pub fn pending_output(&self) -> usize {
        self.read_buf.len()
    }

    /// Terminal input waiting for channel space.
    #[must_use]
    pub fn pending_input(&self) -> usize {
        self.write_buf.len()
    }

    /// Summary for introspection.
    #[must_use]
    pub fn info(&self) -> ConsoleInfo {
        ConsoleInfo {
            status: self.state,
            id: self.id,
            domain: self.domid,
            console_port: self.port,
            local_port: self.ports.local,
            remote_port: self.ports.remote,
            connected: self.peer_addr(),
        }
    }

    /// Starts accepting terminals through `listener`.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error once the console is closed.
    pub fn listen(&mut self, mut listener: ListenerHandle) -> Result<()> {
        if self.state == ConsoleState::Closed {
            listener.stop();
            return Err(CommonError::invalid_state(format!("console {} is closed", self.id)).into());
        }
        if let Some(addr) = listener.local_addr() {
            self.port = addr.port();
        }
        if let Some(mut old) = self.listener.replace(listener) {
            old.stop();
        }
        if self.state == ConsoleState::New {
            self.state = ConsoleState::Listening;
        }
        Ok(())
    }

    /// Attaches a terminal and flushes buffered guest output to it.
    ///
    /// # Errors
    ///
    /// Returns the peer untouched inside [`ConnectRejected`] while another
    /// terminal is attached or once the console is closed.
    pub fn connect(&mut self, peer: Box<dyn ConsolePeer>) -> std::result::Result<(), ConnectRejected> {
        if matches!(self.state, ConsoleState::Connected | ConsoleState::Closed) {
            tracing::info!(
                console = self.id,
                peer = %peer.addr(),
                state = %self.state,
                "console connection rejected"
            );
            return Err(ConnectRejected {
                console: self.id,
                state: self.state,
                peer,
            });
        }
        let addr = peer.addr();
        self.peer = Some(peer);
        self.state = ConsoleState::Connected;
        tracing::info!(console = self.id, domid = self.domid, peer = %addr, "console connected");
        self.events.publish(Event::ConsoleConnected {
            console: self.id,
            addr,
        });
        self.handle_output();
        Ok(())
    }

    /// Detaches and closes the terminal, if any.
    pub fn disconnect(&mut self) {
        let Some(mut peer) = self.peer.take() else {
            return;
        };
        peer.close();
        self.detached(peer.addr());
    }

    /// Handles a hangup reported by terminal `peer`. Stale hangups are ignored.
    pub fn peer_hangup(&mut self, peer: PeerId) {
        if self.peer.as_ref().map(|p| p.id()) != Some(peer) {
            return;
        }
        if let Some(mut peer) = self.peer.take() {
            peer.close();
            self.detached(peer.addr());
        }
    }

    fn detached(&mut self, addr: SocketAddr) {
        if self.state == ConsoleState::Connected {
            self.state = ConsoleState::Listening;
        }
        tracing::info!(console = self.id, peer = %addr, "console disconnected");
        self.events.publish(Event::ConsoleDisconnected {
            console: self.id,
            addr,
        });
    }

    /// Buffers guest output and forwards it if a terminal is attached.
    pub fn request_received(&mut self, msg: &Message) {
        let dropped = self.read_buf.push(msg.payload());
        if dropped > 0 {
            tracing::debug!(console = self.id, dropped, "console output buffer full");
        }
        self.handle_output();
    }

    /// Drains buffered guest output to the terminal.
    ///
    /// Write failures are logged and leave the rest buffered.
    pub fn handle_output(&mut self) {
        if self.state == ConsoleState::Closed {
            return;
        }
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        while !self.read_buf.is_empty() {
            let chunk = self.read_buf.peek(self.output_chunk);
            match peer.write(&chunk) {
                Ok(0) => {
                    tracing::debug!(console = self.id, "console peer accepted nothing");
                    break;
                }
                Ok(n) => self.read_buf.consume(n),
                Err(e) => {
                    tracing::warn!(console = self.id, error = %e, "console peer write failed");
                    break;
                }
            }
        }
    }

    /// Buffers terminal input and forwards it to the guest.
    ///
    /// Returns false, without touching any state, when `peer` is not the
    /// attached terminal.
    pub fn handle_input(&mut self, peer: PeerId, data: &[u8]) -> bool {
        if self.state == ConsoleState::Closed {
            return false;
        }
        if self.peer.as_ref().map(|p| p.id()) != Some(peer) {
            tracing::debug!(console = self.id, peer, "ignoring input from detached peer");
            return false;
        }
        self.write_buf.push(data);
        self.produce_requests();
        true
    }

    /// Sends buffered terminal input while the channel is write-ready.
    ///
    /// Returns the number of messages sent; the guest is notified once if
    /// any were.
    pub fn produce_requests(&mut self) -> usize {
        let Some(channel) = self.channel.as_mut() else {
            return 0;
        };
        let mut sent = 0;
        while !self.write_buf.is_empty() && channel.write_ready() {
            let chunk = self.write_buf.peek(MAX_PAYLOAD);
            let len = chunk.len();
            let result = Message::console_data(chunk).and_then(|msg| channel.send(msg));
            if let Err(e) = result {
                tracing::debug!(console = self.id, error = %e, "console send deferred");
                break;
            }
            self.write_buf.consume(len);
            sent += 1;
        }
        if sent > 0 {
            channel.notify();
        }
        sent
    }

    /// Tears the console down; same as losing the channel.
    pub fn close(&mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.state == ConsoleState::Closed {
            return;
        }
        self.state = ConsoleState::Closed;
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.read_buf.clear();
        self.write_buf.clear();
        tracing::info!(console = self.id, domid = self.domid, "console closed");
        self.events.publish(Event::ConsoleClosed { console: self.id });
    }
}

impl Controller for ConsoleController {
    fn key(&self) -> InstanceKey {
        InstanceKey::domain(self.domid)
    }

    fn major_types(&self) -> &[MajorType] {
        &[MajorType::Console]
    }

    fn is_closed(&self) -> bool {
        self.state == ConsoleState::Closed
    }

    fn channel_mut(&mut self) -> Option<&mut Box<dyn Channel>> {
        self.channel.as_mut()
    }

    fn handle_request(&mut self, msg: &Message) -> Dispatch {
        match msg.message_type() {
            MessageType::ConsoleData => {
                self.request_received(msg);
                Dispatch::Handled
            }
            MessageType::Other { .. } => Dispatch::Unrecognized,
        }
    }

    fn handle_response(&mut self, _msg: &Message) -> Dispatch {
        Dispatch::Handled
    }

    fn on_writable(&mut self) {
        self.produce_requests();
    }

    fn lost_channel(&mut self) {
        self.teardown();
    }
}

//! # xendev-channel
//!
//! The inter-domain message channel that controllers bind to.
//!
//! A channel is a bidirectional, flow-controlled transport between the control
//! plane and one guest. Messages carry a major and minor type and a payload of
//! at most [`MAX_PAYLOAD`] bytes. Readiness changes are reported through a
//! [`SignalHandler`] so the owning event loop never polls.
//!
//! - [`Channel`]: the contract controllers depend on
//! - [`Message`], [`MajorType`], [`MessageType`]: framing
//! - [`MemoryChannel`] / [`GuestEnd`]: an in-process pair standing in for the
//!   guest side

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod memory;
pub mod message;

use std::fmt;
use std::sync::Arc;

pub use error::{ChannelError, Result};
pub use memory::{GuestEnd, MemoryChannel};
pub use message::{Inbound, MajorType, Message, MessageType, MAX_PAYLOAD};

/// Readiness and teardown notifications raised by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSignal {
    /// At least one inbound message can be received.
    Readable,
    /// The outbound ring has free slots again.
    Writable,
    /// The peer went away; the channel will not recover.
    Closed,
}

/// Callback invoked on every [`ChannelSignal`].
pub type SignalHandler = Arc<dyn Fn(ChannelSignal) + Send + Sync>;

/// Event-channel port numbers of both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPorts {
    /// Port in the control domain.
    pub local: u32,
    /// Port in the guest.
    pub remote: u32,
}

/// A flow-controlled message transport to one guest.
pub trait Channel: Send + fmt::Debug {
    /// Port numbers of both ends.
    fn ports(&self) -> ChannelPorts;

    /// Returns true if [`send`](Self::send) would accept a message now.
    fn write_ready(&self) -> bool;

    /// Queues one message for the guest without waking it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotReady`] when the ring is full and
    /// [`ChannelError::Closed`] once the channel is gone.
    fn send(&mut self, msg: Message) -> Result<()>;

    /// Wakes the guest so it processes queued messages.
    fn notify(&mut self);

    /// Takes the next inbound message, if any.
    fn try_recv(&mut self) -> Option<Inbound>;

    /// Returns true once the channel has been closed by either side.
    fn is_closed(&self) -> bool;

    /// Installs the readiness callback, replacing any previous one.
    fn set_signal_handler(&mut self, handler: SignalHandler);

    /// Tears the channel down from the control-plane side.
    fn close(&mut self);
}

//! In-process channel pair.
//!
//! [`MemoryChannel::pair`] returns the control-plane end together with a
//! [`GuestEnd`] that plays the guest: it injects inbound messages, drains what
//! the controller sent, resizes the outbound ring to apply backpressure and
//! closes the channel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ChannelError, Result};
use crate::message::{Inbound, Message};
use crate::{Channel, ChannelPorts, ChannelSignal, SignalHandler};

/// Default number of outbound ring slots.
pub const DEFAULT_RING_SLOTS: usize = 8;

static NEXT_PORT: AtomicU32 = AtomicU32::new(1);

#[derive(Default)]
struct Shared {
    inbound: VecDeque<Inbound>,
    outbound: VecDeque<Message>,
    capacity: usize,
    notifications: usize,
    closed: bool,
    handler: Option<SignalHandler>,
}

impl Shared {
    fn has_room(&self) -> bool {
        !self.closed && self.outbound.len() < self.capacity
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // A panic while holding this lock leaves the queues consistent, so keep going.
    shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn fire(handler: Option<SignalHandler>, signal: ChannelSignal) {
    if let Some(handler) = handler {
        handler(signal);
    }
}

/// Control-plane end of an in-process channel.
pub struct MemoryChannel {
    shared: Arc<Mutex<Shared>>,
    ports: ChannelPorts,
}

/// Guest end of an in-process channel.
#[derive(Clone)]
pub struct GuestEnd {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryChannel {
    /// Creates a connected pair whose outbound ring holds `slots` messages.
    #[must_use]
    pub fn pair(slots: usize) -> (Self, GuestEnd) {
        let local = NEXT_PORT.fetch_add(2, Ordering::Relaxed);
        let shared = Arc::new(Mutex::new(Shared {
            capacity: slots,
            ..Shared::default()
        }));
        let channel = Self {
            shared: Arc::clone(&shared),
            ports: ChannelPorts {
                local,
                remote: local + 1,
            },
        };
        (channel, GuestEnd { shared })
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("ports", &self.ports)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel for MemoryChannel {
    fn ports(&self) -> ChannelPorts {
        self.ports
    }

    fn write_ready(&self) -> bool {
        lock(&self.shared).has_room()
    }

    fn send(&mut self, msg: Message) -> Result<()> {
        let mut shared = lock(&self.shared);
        if shared.closed {
            return Err(ChannelError::Closed);
        }
        if !shared.has_room() {
            return Err(ChannelError::NotReady);
        }
        shared.outbound.push_back(msg);
        Ok(())
    }

    fn notify(&mut self) {
        lock(&self.shared).notifications += 1;
    }

    fn try_recv(&mut self) -> Option<Inbound> {
        lock(&self.shared).inbound.pop_front()
    }

    fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }

    fn set_signal_handler(&mut self, handler: SignalHandler) {
        let readable = {
            let mut shared = lock(&self.shared);
            shared.handler = Some(Arc::clone(&handler));
            !shared.inbound.is_empty()
        };
        if readable {
            handler(ChannelSignal::Readable);
        }
    }

    fn close(&mut self) {
        let mut shared = lock(&self.shared);
        shared.closed = true;
        shared.handler = None;
    }
}

impl GuestEnd {
    /// Delivers a request from the guest.
    pub fn send_request(&self, msg: Message) {
        self.push(Inbound::Request(msg));
    }

    /// Delivers a response from the guest.
    pub fn send_response(&self, msg: Message) {
        self.push(Inbound::Response(msg));
    }

    fn push(&self, inbound: Inbound) {
        let handler = {
            let mut shared = lock(&self.shared);
            if shared.closed {
                tracing::debug!("dropping message sent on a closed channel");
                return;
            }
            shared.inbound.push_back(inbound);
            shared.handler.clone()
        };
        fire(handler, ChannelSignal::Readable);
    }

    /// Consumes everything the control plane has sent so far.
    pub fn take_sent(&self) -> Vec<Message> {
        let (sent, handler) = {
            let mut shared = lock(&self.shared);
            let was_full = !shared.closed && shared.outbound.len() >= shared.capacity;
            let sent: Vec<Message> = shared.outbound.drain(..).collect();
            let handler = if was_full && !sent.is_empty() {
                shared.handler.clone()
            } else {
                None
            };
            (sent, handler)
        };
        fire(handler, ChannelSignal::Writable);
        sent
    }

    /// Number of messages waiting in the outbound ring.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.shared).outbound.len()
    }

    /// Resizes the outbound ring; a size of zero blocks all writes.
    pub fn set_capacity(&self, slots: usize) {
        let handler = {
            let mut shared = lock(&self.shared);
            let was_ready = shared.has_room();
            shared.capacity = slots;
            if !was_ready && shared.has_room() {
                shared.handler.clone()
            } else {
                None
            }
        };
        fire(handler, ChannelSignal::Writable);
    }

    /// Number of times the control plane woke the guest.
    #[must_use]
    pub fn notifications(&self) -> usize {
        lock(&self.shared).notifications
    }

    /// Closes the channel from the guest side.
    pub fn close(&self) {
        let handler = {
            let mut shared = lock(&self.shared);
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.handler.take()
        };
        fire(handler, ChannelSignal::Closed);
    }

    /// Returns true once either side closed the channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::pair(DEFAULT_RING_SLOTS).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler() -> (SignalHandler, Arc<Mutex<Vec<ChannelSignal>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: SignalHandler = Arc::new(move |signal| sink.lock().unwrap().push(signal));
        (handler, seen)
    }

    #[test]
    fn test_send_respects_ring_capacity() {
        let (mut channel, guest) = MemoryChannel::pair(2);
        channel.send(Message::console_data(&b"a"[..]).unwrap()).unwrap();
        channel.send(Message::console_data(&b"b"[..]).unwrap()).unwrap();
        assert!(!channel.write_ready());
        assert!(matches!(
            channel.send(Message::console_data(&b"c"[..]).unwrap()),
            Err(ChannelError::NotReady)
        ));

        assert_eq!(guest.take_sent().len(), 2);
        assert!(channel.write_ready());
    }

    #[test]
    fn test_signals_fire() {
        let (mut channel, guest) = MemoryChannel::pair(1);
        let (handler, seen) = counting_handler();
        channel.set_signal_handler(handler);

        guest.send_request(Message::console_data(&b"x"[..]).unwrap());
        channel.send(Message::console_data(&b"y"[..]).unwrap()).unwrap();
        guest.take_sent();
        guest.close();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ChannelSignal::Readable,
                ChannelSignal::Writable,
                ChannelSignal::Closed
            ]
        );
        assert!(channel.is_closed());
    }

    #[test]
    fn test_handler_sees_messages_queued_before_install() {
        let (mut channel, guest) = MemoryChannel::pair(1);
        guest.send_request(Message::console_data(&b"early"[..]).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        channel.set_signal_handler(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(channel.try_recv(), Some(Inbound::Request(_))));
        assert!(channel.try_recv().is_none());
    }

    #[test]
    fn test_zero_capacity_blocks_writes_until_resized() {
        let (mut channel, guest) = MemoryChannel::pair(0);
        let (handler, seen) = counting_handler();
        channel.set_signal_handler(handler);
        assert!(!channel.write_ready());

        guest.set_capacity(4);
        assert!(channel.write_ready());
        assert_eq!(*seen.lock().unwrap(), vec![ChannelSignal::Writable]);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (mut channel, guest) = MemoryChannel::pair(4);
        channel.close();
        assert!(guest.is_closed());
        assert!(matches!(
            channel.send(Message::console_data(&b"z"[..]).unwrap()),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn test_notifications_counted() {
        let (mut channel, guest) = MemoryChannel::pair(4);
        channel.notify();
        channel.notify();
        assert_eq!(guest.notifications(), 2);
    }
}

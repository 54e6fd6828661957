//! Channel-bound controllers.
//!
//! A controller owns at most one [`Channel`] and turns the messages arriving
//! on it into state changes. Routing is a match on the decoded
//! [`MessageType`](xendev_channel::MessageType) inside each implementation;
//! [`Controller::dispatch`] only filters on the major types a controller
//! registered for and reports what nobody handled.

use std::fmt;

use xendev_channel::{Channel, Inbound, MajorType, Message};

/// Registry key of a controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    /// Owning domain.
    pub domid: u32,
    /// Device within the domain, for per-device controllers.
    pub devid: Option<u32>,
}

impl InstanceKey {
    /// Key of a per-domain controller.
    #[must_use]
    pub const fn domain(domid: u32) -> Self {
        Self { domid, devid: None }
    }

    /// Key of a per-device controller.
    #[must_use]
    pub const fn device(domid: u32, devid: u32) -> Self {
        Self {
            domid,
            devid: Some(devid),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.devid {
            Some(devid) => write!(f, "{}/{}", self.domid, devid),
            None => write!(f, "{}", self.domid),
        }
    }
}

/// Outcome of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler consumed the message.
    Handled,
    /// No handler matched; the message was dropped.
    Unrecognized,
}

/// Lifecycle contract of a channel-bound controller.
pub trait Controller: Send {
    /// Registry key.
    fn key(&self) -> InstanceKey;

    /// Major message types this controller accepts.
    fn major_types(&self) -> &[MajorType];

    /// Returns true once the channel is gone.
    fn is_closed(&self) -> bool;

    /// Bound channel, if still open.
    fn channel_mut(&mut self) -> Option<&mut Box<dyn Channel>>;

    /// Handles a guest-initiated request.
    fn handle_request(&mut self, msg: &Message) -> Dispatch;

    /// Handles the guest's answer to one of our requests.
    fn handle_response(&mut self, _msg: &Message) -> Dispatch {
        Dispatch::Unrecognized
    }

    /// Called when the channel has free slots again.
    fn on_writable(&mut self) {}

    /// Releases everything bound to the channel. Called once, after the
    /// owning factory has deregistered the instance.
    fn lost_channel(&mut self);

    /// Routes one inbound message. Unknown types are logged and dropped.
    fn dispatch(&mut self, inbound: &Inbound) -> Dispatch {
        let msg = inbound.message();
        let outcome = if self.major_types().contains(&msg.major()) {
            match inbound {
                Inbound::Request(msg) => self.handle_request(msg),
                Inbound::Response(msg) => self.handle_response(msg),
            }
        } else {
            Dispatch::Unrecognized
        };
        if outcome == Dispatch::Unrecognized {
            tracing::debug!(
                key = %self.key(),
                message_type = ?msg.message_type(),
                "dropping unrecognized message"
            );
        }
        outcome
    }

    /// Drains and dispatches everything the channel has queued.
    ///
    /// Returns the number of messages taken off the channel.
    fn receive_pending(&mut self) -> usize {
        let mut received = 0;
        while let Some(inbound) = self.channel_mut().and_then(|channel| channel.try_recv()) {
            self.dispatch(&inbound);
            received += 1;
        }
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use xendev_channel::{GuestEnd, MemoryChannel, MessageType};

    struct Recorder {
        channel: Option<Box<dyn Channel>>,
        seen: Vec<MessageType>,
        closed: bool,
    }

    impl Recorder {
        fn new() -> (Self, GuestEnd) {
            let (channel, guest) = MemoryChannel::pair(4);
            let recorder = Self {
                channel: Some(Box::new(channel)),
                seen: Vec::new(),
                closed: false,
            };
            (recorder, guest)
        }
    }

    impl Controller for Recorder {
        fn key(&self) -> InstanceKey {
            InstanceKey::domain(9)
        }

        fn major_types(&self) -> &[MajorType] {
            &[MajorType::Console, MajorType::Shutdown]
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn channel_mut(&mut self) -> Option<&mut Box<dyn Channel>> {
            self.channel.as_mut()
        }

        fn handle_request(&mut self, msg: &Message) -> Dispatch {
            match msg.message_type() {
                MessageType::ConsoleData => {
                    self.seen.push(msg.message_type());
                    Dispatch::Handled
                }
                MessageType::Other { .. } => Dispatch::Unrecognized,
            }
        }

        fn lost_channel(&mut self) {
            self.closed = true;
            self.channel = None;
        }
    }

    #[test]
    fn test_instance_key_display() {
        assert_eq!(InstanceKey::domain(3).to_string(), "3");
        assert_eq!(InstanceKey::device(3, 1).to_string(), "3/1");
    }

    #[test]
    fn test_dispatch_filters_major_types() {
        let (mut recorder, _guest) = Recorder::new();
        let blk = Message::new(MajorType::BlkifBackend, 0, Bytes::new()).unwrap();
        assert_eq!(
            recorder.dispatch(&Inbound::Request(blk)),
            Dispatch::Unrecognized
        );
        assert!(recorder.seen.is_empty());
    }

    #[test]
    fn test_dispatch_unhandled_minor_is_dropped() {
        let (mut recorder, _guest) = Recorder::new();
        let shutdown = Message::new(MajorType::Shutdown, 2, Bytes::new()).unwrap();
        assert_eq!(
            recorder.dispatch(&Inbound::Request(shutdown)),
            Dispatch::Unrecognized
        );
        let response = Message::console_data(&b"ok"[..]).unwrap();
        assert_eq!(
            recorder.dispatch(&Inbound::Response(response)),
            Dispatch::Unrecognized
        );
    }

    #[test]
    fn test_receive_pending_drains_channel() {
        let (mut recorder, guest) = Recorder::new();
        guest.send_request(Message::console_data(&b"a"[..]).unwrap());
        guest.send_request(Message::new(MajorType::MemRequest, 0, Bytes::new()).unwrap());
        guest.send_request(Message::console_data(&b"b"[..]).unwrap());

        assert_eq!(recorder.receive_pending(), 3);
        assert_eq!(recorder.seen.len(), 2);
        assert_eq!(recorder.receive_pending(), 0);
    }

    #[test]
    fn test_receive_pending_without_channel() {
        let (mut recorder, _guest) = Recorder::new();
        recorder.lost_channel();
        assert!(recorder.is_closed());
        assert_eq!(recorder.receive_pending(), 0);
    }
}

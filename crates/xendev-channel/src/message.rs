//! Control message framing.
//!
//! Each message carries a major and minor type plus a payload of up to
//! [`MAX_PAYLOAD`] bytes. The payload carries no further
//! structure at this layer; console data is raw bytes.

use bytes::Bytes;

use crate::error::{ChannelError, Result};

/// Largest payload a single message can carry.
pub const MAX_PAYLOAD: usize = 60;

/// Minor type of console data messages.
pub const CONSOLE_DATA: u8 = 0;

/// Message major types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MajorType {
    /// Console data.
    Console,
    /// Block interface, backend side.
    BlkifBackend,
    /// Block interface, frontend side.
    BlkifFrontend,
    /// Network interface, backend side.
    NetifBackend,
    /// Network interface, frontend side.
    NetifFrontend,
    /// Shutdown requests.
    Shutdown,
    /// Memory reservation requests.
    MemRequest,
    /// Any type this control plane does not know.
    Other(u8),
}

impl MajorType {
    /// Decodes a wire value.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Console,
            1 => Self::BlkifBackend,
            2 => Self::BlkifFrontend,
            3 => Self::NetifBackend,
            4 => Self::NetifFrontend,
            6 => Self::Shutdown,
            7 => Self::MemRequest,
            other => Self::Other(other),
        }
    }

    /// Returns the wire value.
    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            Self::Console => 0,
            Self::BlkifBackend => 1,
            Self::BlkifFrontend => 2,
            Self::NetifBackend => 3,
            Self::NetifFrontend => 4,
            Self::Shutdown => 6,
            Self::MemRequest => 7,
            Self::Other(raw) => raw,
        }
    }
}

/// Decoded (major, minor) pair used for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Bytes written to or read from a guest console.
    ConsoleData,
    /// Anything else, kept raw.
    Other { major: MajorType, minor: u8 },
}

/// One control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    major: MajorType,
    minor: u8,
    payload: Bytes,
}

impl Message {
    /// Builds a message.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD`].
    pub fn new(major: MajorType, minor: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(ChannelError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            major,
            minor,
            payload,
        })
    }

    /// Builds a console data message.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PayloadTooLarge`] if `data` does not fit.
    pub fn console_data(data: impl Into<Bytes>) -> Result<Self> {
        Self::new(MajorType::Console, CONSOLE_DATA, data)
    }

    /// Major type.
    #[must_use]
    pub const fn major(&self) -> MajorType {
        self.major
    }

    /// Minor type.
    #[must_use]
    pub const fn minor(&self) -> u8 {
        self.minor
    }

    /// Payload bytes.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decodes the dispatch type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match (self.major, self.minor) {
            (MajorType::Console, CONSOLE_DATA) => MessageType::ConsoleData,
            (major, minor) => MessageType::Other { major, minor },
        }
    }
}

/// A message received from the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A request initiated by the guest.
    Request(Message),
    /// The guest's answer to a request we sent.
    Response(Message),
}

impl Inbound {
    /// The carried message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        match self {
            Self::Request(msg) | Self::Response(msg) => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_major_type_raw_values() {
        for raw in 0..=255u8 {
            assert_eq!(MajorType::from_raw(raw).raw(), raw);
        }
        assert_eq!(MajorType::from_raw(0), MajorType::Console);
        assert_eq!(MajorType::from_raw(5), MajorType::Other(5));
    }

    #[test]
    fn test_payload_limit() {
        assert!(Message::console_data(vec![0u8; MAX_PAYLOAD]).is_ok());
        let err = Message::console_data(vec![0u8; MAX_PAYLOAD + 1]).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::PayloadTooLarge { size: 61, max: 60 }
        ));
    }

    #[test]
    fn test_message_type_dispatch() {
        let console = Message::console_data(&b"hi"[..]).unwrap();
        assert_eq!(console.message_type(), MessageType::ConsoleData);

        let shutdown = Message::new(MajorType::Shutdown, 1, Bytes::new()).unwrap();
        assert_eq!(
            shutdown.message_type(),
            MessageType::Other {
                major: MajorType::Shutdown,
                minor: 1
            }
        );

        let odd_console = Message::new(MajorType::Console, 9, Bytes::new()).unwrap();
        assert!(matches!(odd_console.message_type(), MessageType::Other { .. }));
    }
}

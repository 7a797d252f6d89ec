//! Immutable envelopes carried between nodes.
//!
//! A [`Message`] names its source and destination (address and port) and
//! carries a typed payload. Messages are erased to a [`Payload`] for
//! transport and checked back into a concrete type by the receiver with
//! [`Message::as_type`] or [`Message::data_as`].

use crate::{port::PortDisplay, Address, KnownPort, Port};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

mod payload;
pub use payload::{Datum, Payload};

/// An envelope for a payload of type `T`.
///
/// Messages with the default type parameter carry an erased [`Payload`];
/// these are what interfaces send and receive.
///
/// # Examples
///
/// ```
/// # use netsim_core::Message;
/// let message = Message::new(1, 5, 2, 7, "hello".to_string());
/// assert_eq!(message.destination_port(), 7);
/// assert_eq!(message.data_as::<String>().unwrap(), "hello");
/// assert!(message.data_as::<i32>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<T = Payload> {
    source: Address,
    source_port: Port,
    destination: Address,
    destination_port: Port,
    data: T,
}

impl Message {
    /// Creates a new message carrying `data`.
    pub fn new<T: Datum>(
        source: Address,
        source_port: impl Into<Port>,
        destination: Address,
        destination_port: impl Into<Port>,
        data: T,
    ) -> Self {
        Self {
            source,
            source_port: source_port.into(),
            destination,
            destination_port: destination_port.into(),
            data: Payload::new(&data),
        }
    }

    /// Whether the payload is a `T`.
    pub fn has_type<T: Datum>(&self) -> bool {
        self.data.is::<T>()
    }

    /// Deserializes the payload as a `T`.
    pub fn data_as<T: Datum>(&self) -> Result<T, MessageError> {
        self.data.decode()
    }

    /// Gets a typed copy of the message.
    pub fn as_type<T: Datum>(&self) -> Result<Message<T>, MessageError> {
        Ok(Message {
            source: self.source,
            source_port: self.source_port,
            destination: self.destination,
            destination_port: self.destination_port,
            data: self.data.decode()?,
        })
    }

    /// Encodes the message into a frame that can be queued on an interface.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a frame produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl<T: Datum> Message<T> {
    /// Erases the payload type so the message can be sent.
    pub fn erase(&self) -> Message {
        Message {
            source: self.source,
            source_port: self.source_port,
            destination: self.destination,
            destination_port: self.destination_port,
            data: Payload::new(&self.data),
        }
    }
}

impl<T> Message<T> {
    /// The address of the node that sent the message.
    pub fn source(&self) -> Address {
        self.source
    }

    /// The port the message is said to originate from.
    pub fn source_port(&self) -> Port {
        self.source_port
    }

    /// The address of the node the message is meant for.
    pub fn destination(&self) -> Address {
        self.destination
    }

    /// The port the message is sent to.
    pub fn destination_port(&self) -> Port {
        self.destination_port
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    /// Whether the message was sent to the given known port.
    pub fn sent_to_port(&self, port: KnownPort) -> bool {
        port.is(self.destination_port)
    }
}

impl<T: Display> Display for Message<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message [{:x}:{} => {:x}:{}]: \"{}\"",
            self.source,
            PortDisplay(self.source_port),
            self.destination,
            PortDisplay(self.destination_port),
            self.data
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Expected a {expected} payload but the message carries {found}")]
    TypeMismatch { expected: &'static str, found: String },
    #[error("Failed to encode or decode a message: {0}")]
    Codec(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rip::{RipDatagram, RipEntry};

    #[test]
    fn frame_round_trip() {
        let messages = [
            Message::new(1, 5, 2, 7, "hello".to_string()),
            Message::new(0x7fff_ffff, KnownPort::Rip, 0, KnownPort::Discovery, ()),
            Message::new(-3, -4, 12, 99, vec![0u8, 1, 2, 255]),
            Message::new(
                4,
                KnownPort::Rip,
                0,
                KnownPort::Discovery,
                RipDatagram::router(vec![RipEntry::new(4, 0), RipEntry::new(9, 3)]),
            ),
            Message::new(4, 3, 5, 3, RipDatagram::not_a_router()),
        ];
        for message in messages {
            let bytes = message.to_bytes().unwrap();
            assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let bytes = Message::new(1, 2, 3, 4, 5i64).to_bytes().unwrap();
        assert!(matches!(
            Message::from_bytes(&bytes[..bytes.len() - 1]),
            Err(MessageError::Codec(_))
        ));
    }

    #[test]
    fn typed_view_keeps_the_envelope() {
        let message = Message::new(1, 5, 2, 7, 42u64);
        let typed = message.as_type::<u64>().unwrap();
        assert_eq!(typed.source(), 1);
        assert_eq!(typed.source_port(), 5);
        assert_eq!(typed.destination(), 2);
        assert_eq!(typed.destination_port(), 7);
        assert_eq!(*typed.data(), 42);
        assert_eq!(typed.erase(), message);
        assert!(message.as_type::<String>().is_err());
    }

    #[test]
    fn display_uses_port_names() {
        let message = Message::new(0x1a, KnownPort::Rip, 2, 4242, "x".to_string());
        let text = message.to_string();
        assert!(text.starts_with("Message [1a:RIP => 2:4242]"), "{}", text);
    }
}

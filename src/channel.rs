use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};

/// The delivery guarantee a message is sent with
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Channel {
    /// best effort: no sequence number, no ack, no retransmit
    Unreliable = 0,
    /// at-least-once delivery to the sender, exactly-once to the application
    Reliable = 1,
    /// exactly-once delivery to the application, in the order the messages were sent
    ReliableOrdered = 2,
}

impl Channel {
    /// reliable channels carry a sequence number, and their frames are acknowledged
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Channel::Unreliable)
    }
}

/// The audience a message is addressed to. The transport carries this as part of the frame
///  header without interpreting it; routing based on it is up to the application.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Target {
    Server = 0,
    All = 1,
    Others = 2,
    Me = 3,
}

/// The first byte of every logical message. All values except [MessageType::ACKNOWLEDGEMENT]
///  are available to the application.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageType(pub u8);

impl MessageType {
    pub const ACKNOWLEDGEMENT: MessageType = MessageType(2);

    pub fn is_reserved(&self) -> bool {
        *self == MessageType::ACKNOWLEDGEMENT
    }
}

impl Debug for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_reserved() {
            write!(f, "ACK")
        }
        else {
            write!(f, "MessageType({})", self.0)
        }
    }
}

/// Whether this end of the connection acts as the server or as a client. The transport itself
///  is symmetric, the role is passed to the application with every received message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    Server,
    Client,
}

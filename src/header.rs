//! Message type tags handed to the sender alongside opaque payloads.

use std::fmt;

/// Top-level message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Handshake,
    Message,
    RecvError,
    LightHouse,
    Test,
    CloseTunnel,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Handshake => "handshake",
            MessageType::Message => "message",
            MessageType::RecvError => "recvError",
            MessageType::LightHouse => "lightHouse",
            MessageType::Test => "test",
            MessageType::CloseTunnel => "closeTunnel",
        };
        write!(f, "{}", s)
    }
}

/// Message subtype, interpreted relative to the message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageSubType {
    None,
    TestRequest,
    TestReply,
    HandshakeIxPsk0,
}

impl fmt::Display for MessageSubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageSubType::None => "none",
            MessageSubType::TestRequest => "testRequest",
            MessageSubType::TestReply => "testReply",
            MessageSubType::HandshakeIxPsk0 => "ix_psk0",
        };
        write!(f, "{}", s)
    }
}

//! Connection protocol.
//!
//! A connecting client sends a fixed-size hello on the channel it wants:
//!
//! ```text
//! RPC:    48 45 4C 4C 4F BA DA 55 | 32-byte zero-padded UTF-8 name
//! Stream: "HELLO-STREAM"          | 16-byte client guid
//! ```
//!
//! The server replies with the client guid (RPC) or `OK` (Stream) when the
//! connection is allowed, or with a length-prefixed `ConnectionResponse`
//! before closing the transport when it is denied.

mod handshake;

pub use handshake::{parse_hello, Handshake, HandshakeProgress, Hello, HelloParse};

use crate::config::ProtocolConfig;
use std::fmt;
use uuid::Uuid;

/// Status reported to a client when its connection attempt is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Ok,
    MalformedMessage,
    Timeout,
    /// The client spoke the other channel's hello.
    WrongType,
}

impl ConnectionStatus {
    pub fn code(self) -> u32 {
        match self {
            ConnectionStatus::Ok => 0,
            ConnectionStatus::MalformedMessage => 1,
            ConnectionStatus::Timeout => 2,
            ConnectionStatus::WrongType => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ConnectionStatus::Ok),
            1 => Some(ConnectionStatus::MalformedMessage),
            2 => Some(ConnectionStatus::Timeout),
            3 => Some(ConnectionStatus::WrongType),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Ok => "OK",
            ConnectionStatus::MalformedMessage => "MALFORMED_MESSAGE",
            ConnectionStatus::Timeout => "TIMEOUT",
            ConnectionStatus::WrongType => "WRONG_TYPE",
        };
        write!(f, "{}", name)
    }
}

/// Which of the two listeners a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Rpc,
    Stream,
}

impl ChannelKind {
    pub fn header(self) -> &'static [u8] {
        match self {
            ChannelKind::Rpc => &ProtocolConfig::RPC_HELLO_HEADER,
            ChannelKind::Stream => &ProtocolConfig::STREAM_HELLO_HEADER,
        }
    }

    /// Full hello size: header plus payload.
    pub fn hello_length(self) -> usize {
        self.header().len()
            + match self {
                ChannelKind::Rpc => ProtocolConfig::CLIENT_NAME_LENGTH,
                ChannelKind::Stream => ProtocolConfig::CLIENT_IDENTIFIER_LENGTH,
            }
    }

    pub fn other(self) -> Self {
        match self {
            ChannelKind::Rpc => ChannelKind::Stream,
            ChannelKind::Stream => ChannelKind::Rpc,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Rpc => write!(f, "RPC"),
            ChannelKind::Stream => write!(f, "stream"),
        }
    }
}

/// Identifier assigned to an RPC client, shared by its stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connection awaiting a verdict, as shown to connection hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub kind: ChannelKind,
    pub client_id: ClientId,
    /// Client name for RPC connections; the RPC client's name for streams.
    pub name: String,
    pub address: String,
}

/// Opinion of a connection hook about a pending attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// Keep the attempt pending and ask again on a later tick.
    Defer,
    NoOpinion,
}

/// Outcome of combining every hook's [`Decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    Pending,
}

impl Verdict {
    /// Any denial wins, then any allowance, then any deferral. With no
    /// opinions the attempt is allowed.
    pub fn combine(decisions: impl IntoIterator<Item = Decision>) -> Self {
        let mut allow = false;
        let mut defer = false;
        for decision in decisions {
            match decision {
                Decision::Deny => return Verdict::Deny,
                Decision::Allow => allow = true,
                Decision::Defer => defer = true,
                Decision::NoOpinion => {}
            }
        }
        if allow || !defer {
            Verdict::Allow
        } else {
            Verdict::Pending
        }
    }
}

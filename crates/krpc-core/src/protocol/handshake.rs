//! Hello parsing and the per-connection handshake state.

use super::{ChannelKind, ClientId, ConnectionStatus};
use crate::codec::wire::frame;
use crate::config::ProtocolConfig;
use crate::messages::{ConnectionResponse, WireMessage};
use crate::transport::ByteStream;
use crate::Result;
use std::time::Instant;
use tracing::{debug, warn};

/// Parsed hello payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hello {
    Rpc { name: String },
    Stream { client_id: ClientId },
}

/// Result of inspecting the bytes received so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloParse {
    /// Not enough bytes yet; nothing has been judged.
    Incomplete,
    Complete(Hello),
    Invalid {
        status: ConnectionStatus,
        message: String,
    },
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inspect the start of a connection on a `kind` listener.
///
/// Headers are compared only once enough bytes for a whole hello are present,
/// so a short prefix is never judged.
pub fn parse_hello(kind: ChannelKind, buf: &[u8]) -> HelloParse {
    let other = kind.other();
    if buf.len() >= kind.hello_length().min(other.hello_length())
        && buf.starts_with(other.header())
    {
        return HelloParse::Invalid {
            status: ConnectionStatus::WrongType,
            message: format!(
                "Connection request was for the {} server, but this is the {} server. \
                 Did you connect to the wrong port number?",
                other, kind
            ),
        };
    }
    if buf.len() < kind.hello_length() {
        return HelloParse::Incomplete;
    }

    let header_len = kind.header().len();
    let (header, payload) = buf[..kind.hello_length()].split_at(header_len);
    if header != kind.header() {
        return HelloParse::Invalid {
            status: ConnectionStatus::MalformedMessage,
            message: format!("Header should be '{}' but got '{}'", hex(kind.header()), hex(header)),
        };
    }

    match kind {
        ChannelKind::Rpc => parse_client_name(payload),
        ChannelKind::Stream => {
            let mut bytes = [0u8; ProtocolConfig::CLIENT_IDENTIFIER_LENGTH];
            bytes.copy_from_slice(payload);
            HelloParse::Complete(Hello::Stream {
                client_id: ClientId::from_bytes(bytes),
            })
        }
    }
}

fn parse_client_name(payload: &[u8]) -> HelloParse {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    let malformed = |message: &str| HelloParse::Invalid {
        status: ConnectionStatus::MalformedMessage,
        message: message.to_string(),
    };
    if payload[end..].iter().any(|b| *b != 0) {
        return malformed("Client name is not zero padded");
    }
    match std::str::from_utf8(&payload[..end]) {
        Ok(name) => HelloParse::Complete(Hello::Rpc {
            name: name.to_string(),
        }),
        Err(_) => malformed("Client name is not valid UTF-8"),
    }
}

/// Progress of a handshake after a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeProgress {
    Waiting,
    Ready(Hello),
    Failed {
        status: ConnectionStatus,
        message: String,
    },
    Disconnected,
}

/// A transport that has been accepted but not yet allowed or denied.
pub struct Handshake {
    kind: ChannelKind,
    stream: Box<dyn ByteStream>,
    buffer: Vec<u8>,
    started: Instant,
    hello: Option<Hello>,
}

impl Handshake {
    pub fn new(kind: ChannelKind, stream: Box<dyn ByteStream>, now: Instant) -> Self {
        Self {
            kind,
            stream,
            buffer: Vec::with_capacity(kind.hello_length()),
            started: now,
            hello: None,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn address(&self) -> String {
        self.stream.peer_address()
    }

    pub fn connected(&self) -> bool {
        self.stream.connected()
    }

    /// Read what is available (never past the hello) and judge it.
    pub fn poll(&mut self, now: Instant) -> HandshakeProgress {
        if let Some(hello) = &self.hello {
            return HandshakeProgress::Ready(hello.clone());
        }

        let wanted = self.kind.hello_length() - self.buffer.len();
        if wanted > 0 && self.stream.data_available() > 0 {
            let mut chunk = vec![0u8; wanted];
            match self.stream.read(&mut chunk) {
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(_) => return HandshakeProgress::Disconnected,
            }
        }

        match parse_hello(self.kind, &self.buffer) {
            HelloParse::Complete(hello) => {
                self.hello = Some(hello.clone());
                HandshakeProgress::Ready(hello)
            }
            HelloParse::Invalid { status, message } => {
                warn!(
                    "Invalid {} hello from {}: {} (received {})",
                    self.kind,
                    self.address(),
                    message,
                    hex(&self.buffer)
                );
                HandshakeProgress::Failed { status, message }
            }
            HelloParse::Incomplete => {
                if !self.stream.connected() {
                    HandshakeProgress::Disconnected
                } else if now.duration_since(self.started) >= ProtocolConfig::HANDSHAKE_TIMEOUT {
                    HandshakeProgress::Failed {
                        status: ConnectionStatus::Timeout,
                        message: format!(
                            "Timed out waiting for the {} hello after {:?}",
                            self.kind,
                            ProtocolConfig::HANDSHAKE_TIMEOUT
                        ),
                    }
                } else {
                    HandshakeProgress::Waiting
                }
            }
        }
    }

    /// Write the success reply and hand the transport over.
    pub fn allow(mut self, reply: &[u8]) -> Result<Box<dyn ByteStream>> {
        self.stream.write(reply)?;
        debug!("Allowed {} connection from {}", self.kind, self.address());
        Ok(self.stream)
    }

    /// Write a status-coded denial and close the transport.
    pub fn deny(mut self, status: ConnectionStatus, message: &str) {
        let response = ConnectionResponse {
            status,
            message: message.to_string(),
        };
        if let Err(e) = self.stream.write(&frame(&response.encode())) {
            debug!("Failed to send denial to {}: {}", self.address(), e);
        }
        self.stream.close();
        debug!(
            "Denied {} connection from {} ({})",
            self.kind,
            self.address(),
            status
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;

    fn rpc_hello(name: &str) -> Vec<u8> {
        let mut hello = ProtocolConfig::RPC_HELLO_HEADER.to_vec();
        let mut payload = [0u8; ProtocolConfig::CLIENT_NAME_LENGTH];
        payload[..name.len()].copy_from_slice(name.as_bytes());
        hello.extend_from_slice(&payload);
        hello
    }

    #[test]
    fn test_rpc_hello() {
        assert_eq!(
            parse_hello(ChannelKind::Rpc, &rpc_hello("Jeb")),
            HelloParse::Complete(Hello::Rpc { name: "Jeb".into() })
        );
        assert_eq!(
            parse_hello(ChannelKind::Rpc, &rpc_hello("")),
            HelloParse::Complete(Hello::Rpc {
                name: String::new()
            })
        );
    }

    #[test]
    fn test_short_hello_is_incomplete() {
        let hello = rpc_hello("Jeb");
        for len in 0..hello.len() {
            assert_eq!(
                parse_hello(ChannelKind::Rpc, &hello[..len]),
                HelloParse::Incomplete,
                "prefix of {} bytes",
                len
            );
        }
    }

    #[test]
    fn test_corrupted_header_is_malformed() {
        let mut hello = rpc_hello("Jeb");
        hello[3] ^= 0xFF;
        assert!(matches!(
            parse_hello(ChannelKind::Rpc, &hello),
            HelloParse::Invalid {
                status: ConnectionStatus::MalformedMessage,
                ..
            }
        ));
    }

    #[test]
    fn test_name_padding_must_be_zero() {
        let mut hello = rpc_hello("Jeb");
        hello[ProtocolConfig::RPC_HELLO_HEADER.len() + 10] = b'x';
        assert!(matches!(
            parse_hello(ChannelKind::Rpc, &hello),
            HelloParse::Invalid { .. }
        ));
    }

    #[test]
    fn test_wrong_channel_detected() {
        let mut stream_hello = ProtocolConfig::STREAM_HELLO_HEADER.to_vec();
        stream_hello.extend_from_slice(&[7u8; 16]);
        assert!(matches!(
            parse_hello(ChannelKind::Rpc, &stream_hello),
            HelloParse::Invalid {
                status: ConnectionStatus::WrongType,
                ..
            }
        ));
        assert!(matches!(
            parse_hello(ChannelKind::Stream, &rpc_hello("Jeb")),
            HelloParse::Invalid {
                status: ConnectionStatus::WrongType,
                ..
            }
        ));
        assert_eq!(
            parse_hello(ChannelKind::Stream, &stream_hello),
            HelloParse::Complete(Hello::Stream {
                client_id: ClientId::from_bytes([7u8; 16])
            })
        );
    }

    #[test]
    fn test_handshake_resumes_across_polls() {
        let (server, client) = memory::pair("test");
        let now = Instant::now();
        let mut handshake = Handshake::new(ChannelKind::Rpc, Box::new(server), now);
        let hello = rpc_hello("Val");

        client.send(&hello[..5]);
        assert_eq!(handshake.poll(now), HandshakeProgress::Waiting);
        client.send(&hello[5..]);
        assert_eq!(
            handshake.poll(now),
            HandshakeProgress::Ready(Hello::Rpc { name: "Val".into() })
        );

        let stream = handshake.allow(b"guid").unwrap();
        assert!(stream.connected());
        assert_eq!(client.received(), b"guid".to_vec());
    }

    #[test]
    fn test_handshake_times_out() {
        let (server, client) = memory::pair("test");
        let now = Instant::now();
        let mut handshake = Handshake::new(ChannelKind::Rpc, Box::new(server), now);
        client.send(&ProtocolConfig::RPC_HELLO_HEADER);
        let later = now + ProtocolConfig::HANDSHAKE_TIMEOUT;
        match handshake.poll(later) {
            HandshakeProgress::Failed { status, .. } => {
                assert_eq!(status, ConnectionStatus::Timeout)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_denial_writes_connection_response() {
        let (server, client) = memory::pair("test");
        let handshake = Handshake::new(ChannelKind::Stream, Box::new(server), Instant::now());
        handshake.deny(ConnectionStatus::MalformedMessage, "bad");

        let reply = client.received();
        let mut reader = crate::codec::wire::WireReader::new(&reply);
        let body = reader.read_length_delimited().unwrap();
        let response = ConnectionResponse::decode(body).unwrap();
        assert_eq!(response.status, ConnectionStatus::MalformedMessage);
        assert_eq!(response.message, "bad");
        assert!(client.is_closed());
    }
}

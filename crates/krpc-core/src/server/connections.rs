//! Accepting transports, completing handshakes and pruning dead clients.

use super::{Core, PendingConnection, RpcClient, ServerEvent, StreamClient};
use crate::channel::{RequestChannel, StreamChannel};
use crate::config::ProtocolConfig;
use crate::protocol::{
    ChannelKind, ClientId, ConnectionAttempt, ConnectionStatus, Handshake, HandshakeProgress,
    Hello, Verdict,
};
use std::time::Instant;
use tracing::{debug, info, warn};

impl Core {
    /// Accept new transports, advance pending handshakes and drop clients
    /// whose transport has gone away.
    pub(super) fn update_connections(&mut self, now: Instant) {
        while let Some(stream) = self.rpc_listener.poll_accept() {
            debug!("Accepted RPC transport from {}", stream.peer_address());
            self.pending.push(PendingConnection {
                handshake: Handshake::new(ChannelKind::Rpc, stream, now),
                assigned: ClientId::new(),
            });
        }
        while let Some(stream) = self.stream_listener.poll_accept() {
            debug!("Accepted stream transport from {}", stream.peer_address());
            self.pending.push(PendingConnection {
                handshake: Handshake::new(ChannelKind::Stream, stream, now),
                assigned: ClientId::new(),
            });
        }

        let pending = std::mem::take(&mut self.pending);
        for mut connection in pending {
            match connection.handshake.poll(now) {
                HandshakeProgress::Waiting => self.pending.push(connection),
                HandshakeProgress::Disconnected => {
                    debug!(
                        "{} transport from {} closed during handshake",
                        connection.handshake.kind(),
                        connection.handshake.address()
                    );
                }
                HandshakeProgress::Failed { status, message } => {
                    connection.handshake.deny(status, &message);
                }
                HandshakeProgress::Ready(hello) => self.verify(connection, hello),
            }
        }

        self.prune_disconnected();
    }

    /// Decide a connection whose hello has been received.
    fn verify(&mut self, connection: PendingConnection, hello: Hello) {
        if !connection.handshake.connected() {
            debug!(
                "{} transport from {} closed while awaiting a verdict",
                connection.handshake.kind(),
                connection.handshake.address()
            );
            return;
        }
        let attempt = match &hello {
            Hello::Rpc { name } => ConnectionAttempt {
                kind: ChannelKind::Rpc,
                client_id: connection.assigned,
                name: name.clone(),
                address: connection.handshake.address(),
            },
            Hello::Stream { client_id } => {
                let Some(owner) = self.clients.get(client_id) else {
                    connection.handshake.deny(
                        ConnectionStatus::MalformedMessage,
                        &format!("No RPC client is connected with identifier {}", client_id),
                    );
                    return;
                };
                if self.stream_clients.contains_key(client_id) {
                    connection.handshake.deny(
                        ConnectionStatus::MalformedMessage,
                        &format!("Client {} already has a stream connection", client_id),
                    );
                    return;
                }
                ConnectionAttempt {
                    kind: ChannelKind::Stream,
                    client_id: *client_id,
                    name: owner.name.clone(),
                    address: connection.handshake.address(),
                }
            }
        };

        match Verdict::combine(self.hooks.iter().map(|hook| hook(&attempt))) {
            Verdict::Pending => self.pending.push(connection),
            Verdict::Deny => {
                warn!(
                    "{} connection from {} ({}) denied",
                    attempt.kind, attempt.address, attempt.name
                );
                connection
                    .handshake
                    .deny(ConnectionStatus::MalformedMessage, "Connection request denied");
            }
            Verdict::Allow => match attempt.kind {
                ChannelKind::Rpc => self.admit_rpc(connection.handshake, attempt),
                ChannelKind::Stream => self.admit_stream(connection.handshake, attempt),
            },
        }
    }

    fn admit_rpc(&mut self, handshake: Handshake, attempt: ConnectionAttempt) {
        let id = attempt.client_id;
        let stream = match handshake.allow(id.as_bytes()) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Failed to reply to {}: {}", attempt.address, e);
                return;
            }
        };
        self.clients.insert(
            id,
            RpcClient {
                name: attempt.name.clone(),
                channel: RequestChannel::new(stream),
            },
        );
        if let Err(e) = self.scheduler.add(id) {
            warn!("Client {} could not be scheduled: {}", id, e);
        }
        info!(
            "Client {} ({}) connected from {}",
            attempt.name, id, attempt.address
        );
        if let Some(info) = self.client_info(id) {
            self.emit(&ServerEvent::ClientConnected(info));
        }
    }

    fn admit_stream(&mut self, handshake: Handshake, attempt: ConnectionAttempt) {
        let stream = match handshake.allow(&ProtocolConfig::STREAM_OK_MESSAGE) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Failed to reply to {}: {}", attempt.address, e);
                return;
            }
        };
        info!(
            "Stream client for {} ({}) connected from {}",
            attempt.name, attempt.client_id, attempt.address
        );
        self.stream_clients.insert(
            attempt.client_id,
            StreamClient {
                channel: StreamChannel::new(stream),
            },
        );
    }

    fn prune_disconnected(&mut self) {
        let gone: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| !client.channel.connected())
            .map(|(id, _)| *id)
            .collect();
        for id in gone {
            self.disconnect_client(id);
        }

        let gone_streams: Vec<ClientId> = self
            .stream_clients
            .iter()
            .filter(|(_, client)| !client.channel.connected())
            .map(|(id, _)| *id)
            .collect();
        for id in gone_streams {
            self.disconnect_stream_client(id);
        }
        for client in self.stream_clients.values_mut() {
            client.channel.discard_input();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ProtocolConfig;
    use crate::protocol::{ClientId, ConnectionStatus, Decision};
    use crate::server::test_support::*;
    use crate::service::ServiceRegistry;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_rpc_handshake_assigns_identifier() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let first = server.connect("Jeb");
        let second = server.connect("Bill");
        assert_ne!(first.id, second.id);
        let names: Vec<String> = server.core.clients().into_iter().map(|c| c.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Jeb".to_string()));
    }

    #[test]
    fn test_partial_hello_waits() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let transport = server.rpc.connect().unwrap();
        let hello = rpc_hello("Jeb");
        transport.send(&hello[..10]);
        server.core.update();
        assert!(transport.received().is_empty());
        assert!(!transport.is_closed());
        assert!(server.core.clients().is_empty());

        transport.send(&hello[10..]);
        server.core.update();
        assert_eq!(transport.received().len(), ProtocolConfig::CLIENT_IDENTIFIER_LENGTH);
        assert_eq!(server.core.clients().len(), 1);
    }

    #[test]
    fn test_bad_header_denied() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let transport = server.rpc.connect().unwrap();
        let mut hello = rpc_hello("Jeb");
        hello[0] = 0x00;
        transport.send(&hello);
        server.core.update();
        let denial = decode_denial(&transport.received());
        assert_eq!(denial.status, ConnectionStatus::MalformedMessage);
        assert!(transport.is_closed());
    }

    #[test]
    fn test_stream_hello_on_rpc_port_is_wrong_type() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let transport = server.rpc.connect().unwrap();
        transport.send(&stream_hello(ClientId::new()));
        server.core.update();
        assert_eq!(
            decode_denial(&transport.received()).status,
            ConnectionStatus::WrongType
        );
    }

    #[test]
    fn test_stream_requires_known_client() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let transport = server.stream.connect().unwrap();
        transport.send(&stream_hello(ClientId::new()));
        server.core.update();
        let denial = decode_denial(&transport.received());
        assert_eq!(denial.status, ConnectionStatus::MalformedMessage);
        assert!(denial.message.starts_with("No RPC client"));
    }

    #[test]
    fn test_stream_connection_attaches_to_client() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let client = server.connect("Jeb");
        let _stream = server.connect_stream(&client);
        assert!(server.core.clients()[0].stream_connected);

        // A second stream for the same client is refused.
        let duplicate = server.stream.connect().unwrap();
        duplicate.send(&stream_hello(client.id));
        server.core.update();
        assert!(decode_denial(&duplicate.received())
            .message
            .contains("already has a stream connection"));
    }

    #[test]
    fn test_hooks_deny_and_defer() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let gate = Arc::new(Mutex::new(Decision::Defer));
        let current = gate.clone();
        server.core.add_connection_hook(move |attempt| {
            if attempt.name == "Mallory" {
                Decision::Deny
            } else {
                *current.lock().unwrap()
            }
        });

        let mallory = server.rpc.connect().unwrap();
        mallory.send(&rpc_hello("Mallory"));
        server.core.update();
        assert!(mallory.is_closed());

        let jeb = server.rpc.connect().unwrap();
        jeb.send(&rpc_hello("Jeb"));
        server.core.update();
        server.core.update();
        assert!(jeb.received().is_empty());
        assert!(server.core.clients().is_empty());

        *gate.lock().unwrap() = Decision::NoOpinion;
        server.core.update();
        assert_eq!(jeb.received().len(), 16);
        assert_eq!(server.core.clients()[0].name, "Jeb");
    }

    #[test]
    fn test_closing_rpc_drops_stream_client() {
        let mut server = TestServer::new(TestServer::quick_config(), ServiceRegistry::new());
        let client = server.connect("Jeb");
        let stream = server.connect_stream(&client);
        client.transport.close();
        server.core.update();
        assert!(server.core.clients().is_empty());
        assert!(stream.transport.is_closed());
    }
}

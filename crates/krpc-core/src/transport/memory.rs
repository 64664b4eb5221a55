//! In-process transport.
//!
//! A [`MemoryStream`] is the server end of a connection and a
//! [`MemoryClient`] the client end; they share two byte queues and a closed
//! flag. A [`MemoryListener`] accepts connections made through its
//! [`MemoryConnector`].

use super::{ByteStream, Listener};
use crate::{KrpcError, Result};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Shared {
    to_server: Mutex<VecDeque<u8>>,
    to_client: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

fn lock(queue: &Mutex<VecDeque<u8>>) -> MutexGuard<'_, VecDeque<u8>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a connected server/client pair.
pub fn pair(address: impl Into<String>) -> (MemoryStream, MemoryClient) {
    let shared = Arc::new(Shared::default());
    (
        MemoryStream {
            shared: shared.clone(),
            address: address.into(),
        },
        MemoryClient { shared },
    )
}

/// Server end of an in-process connection.
#[derive(Debug)]
pub struct MemoryStream {
    shared: Arc<Shared>,
    address: String,
}

impl ByteStream for MemoryStream {
    fn data_available(&mut self) -> usize {
        lock(&self.shared.to_server).len()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut queue = lock(&self.shared.to_server);
        if queue.is_empty() {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(KrpcError::ClientDisconnected);
            }
            return Ok(0);
        }
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        self.shared.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(KrpcError::ClientDisconnected);
        }
        lock(&self.shared.to_client).extend(data.iter().copied());
        self.shared
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    fn connected(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) || !lock(&self.shared.to_server).is_empty()
    }

    fn peer_address(&self) -> String {
        self.address.clone()
    }

    fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Relaxed)
    }

    fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }
}

/// Client end of an in-process connection.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    shared: Arc<Shared>,
}

impl MemoryClient {
    pub fn send(&self, data: &[u8]) {
        lock(&self.shared.to_server).extend(data.iter().copied());
    }

    /// Take everything the server has written so far.
    pub fn received(&self) -> Vec<u8> {
        lock(&self.shared.to_client).drain(..).collect()
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Connects in-process clients to a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    pending: Arc<Mutex<VecDeque<MemoryStream>>>,
    running: Arc<AtomicBool>,
    next_port: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Open a connection. Returns `None` when the listener is not running.
    pub fn connect(&self) -> Option<MemoryClient> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (server, client) = pair(format!("memory:{}", port));
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(server);
        Some(client)
    }
}

/// Listener accepting in-process connections.
#[derive(Debug)]
pub struct MemoryListener {
    connector: MemoryConnector,
}

impl Default for MemoryListener {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryListener {
    pub fn new() -> Self {
        Self {
            connector: MemoryConnector {
                pending: Arc::new(Mutex::new(VecDeque::new())),
                running: Arc::new(AtomicBool::new(false)),
                next_port: Arc::new(AtomicU64::new(1)),
            },
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        self.connector.clone()
    }
}

impl Listener for MemoryListener {
    fn start(&mut self) -> Result<()> {
        self.connector.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.connector.running.store(false, Ordering::SeqCst);
        self.connector
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn running(&self) -> bool {
        self.connector.running.load(Ordering::SeqCst)
    }

    fn poll_accept(&mut self) -> Option<Box<dyn ByteStream>> {
        self.connector
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .map(|stream| Box::new(stream) as Box<dyn ByteStream>)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_exchanges_bytes() {
        let (mut server, client) = pair("a");
        client.send(b"hello");
        assert_eq!(server.data_available(), 5);
        let mut buf = [0u8; 3];
        assert_eq!(server.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(server.bytes_read(), 3);

        server.write(b"ok").unwrap();
        assert_eq!(client.received(), b"ok".to_vec());
        assert_eq!(server.bytes_written(), 2);
    }

    #[test]
    fn test_close_drains_then_disconnects() {
        let (mut server, client) = pair("a");
        client.send(b"x");
        client.close();
        assert!(server.connected());
        let mut buf = [0u8; 4];
        assert_eq!(server.read(&mut buf).unwrap(), 1);
        assert!(!server.connected());
        assert!(matches!(
            server.read(&mut buf),
            Err(KrpcError::ClientDisconnected)
        ));
        assert!(server.write(b"y").is_err());
    }

    #[test]
    fn test_listener_accepts_only_while_running() {
        let mut listener = MemoryListener::new();
        let connector = listener.connector();
        assert!(connector.connect().is_none());

        listener.start().unwrap();
        let _client = connector.connect().unwrap();
        let accepted = listener.poll_accept().unwrap();
        assert_eq!(accepted.peer_address(), "memory:1");
        assert!(listener.poll_accept().is_none());

        listener.stop();
        assert!(!listener.running());
        assert!(connector.connect().is_none());
    }
}

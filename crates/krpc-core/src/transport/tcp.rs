//! TCP transport on the tokio runtime.
//!
//! The accept loop and one task per connection run on tokio; the tick thread
//! only touches channels, so every [`ByteStream`] operation is non-blocking.
//!
//! # Shutdown
//!
//! The accept loop stops on a oneshot signal. Connection tasks watch a shared
//! shutdown flag and also finish once their stream is closed or dropped,
//! after flushing anything already queued for writing.

use super::{ByteStream, Listener};
use crate::config::ProtocolConfig;
use crate::{KrpcError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

/// Server end of a TCP connection.
pub struct TcpByteStream {
    address: String,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    pending: BytesMut,
    alive: Arc<AtomicBool>,
    peer_gone: bool,
    bytes_read: u64,
    bytes_written: u64,
}

impl TcpByteStream {
    /// Move everything the connection task has received into `pending`.
    fn fill(&mut self) {
        loop {
            match self.inbound.try_recv() {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.peer_gone = true;
                    break;
                }
            }
        }
    }
}

impl ByteStream for TcpByteStream {
    fn data_available(&mut self) -> usize {
        self.fill();
        self.pending.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.fill();
        if self.pending.is_empty() {
            if self.peer_gone || self.outbound.is_none() {
                return Err(KrpcError::ClientDisconnected);
            }
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        self.bytes_read += n as u64;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(KrpcError::ClientDisconnected)?;
        outbound
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| KrpcError::ClientDisconnected)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the sender lets the task flush queued writes, then exit.
        self.outbound = None;
    }

    fn connected(&self) -> bool {
        self.outbound.is_some()
            && (!self.peer_gone && self.alive.load(Ordering::SeqCst) || !self.pending.is_empty())
    }

    fn peer_address(&self) -> String {
        self.address.clone()
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

struct Running {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    accepted_rx: mpsc::UnboundedReceiver<TcpByteStream>,
}

/// TCP listener for one channel.
pub struct TcpListener {
    name: &'static str,
    address: String,
    port: u16,
    runtime: Option<Handle>,
    running: Option<Running>,
}

impl TcpListener {
    /// Create a listener for `address:port`. Port 0 asks the OS for a port.
    pub fn new(name: &'static str, address: impl Into<String>, port: u16) -> Self {
        Self {
            name,
            address: address.into(),
            port,
            runtime: None,
            running: None,
        }
    }

    /// Run the listener's tasks on `handle` instead of the ambient runtime.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    fn runtime(&self) -> Result<Handle> {
        match &self.runtime {
            Some(handle) => Ok(handle.clone()),
            None => Handle::try_current().map_err(|e| KrpcError::Io {
                message: format!("No tokio runtime for the {} listener: {}", self.name, e),
                source: None,
            }),
        }
    }

    async fn accept_loop(
        name: &'static str,
        listener: tokio::net::TcpListener,
        accepted_tx: mpsc::UnboundedSender<TcpByteStream>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("{} server stopped accepting", name);
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((socket, peer_addr)) => {
                            debug!("{} connection from {}", name, peer_addr);
                            let (inbound_tx, inbound) = mpsc::unbounded_channel();
                            let (outbound, outbound_rx) = mpsc::unbounded_channel();
                            let alive = Arc::new(AtomicBool::new(true));
                            let stream = TcpByteStream {
                                address: peer_addr.to_string(),
                                inbound,
                                outbound: Some(outbound),
                                pending: BytesMut::new(),
                                alive: alive.clone(),
                                peer_gone: false,
                                bytes_read: 0,
                                bytes_written: 0,
                            };
                            if accepted_tx.send(stream).is_err() {
                                break;
                            }
                            let mut conn_shutdown = conn_shutdown_rx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    socket,
                                    inbound_tx,
                                    outbound_rx,
                                    &mut conn_shutdown,
                                )
                                .await
                                {
                                    debug!("{} connection {} ended: {}", name, peer_addr, e);
                                }
                                alive.store(false, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            error!("{} accept error: {}", name, e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        mut socket: TcpStream,
        inbound_tx: mpsc::UnboundedSender<Bytes>,
        mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        socket.set_nodelay(true)?;
        let (mut reader, mut writer) = socket.split();
        let mut buf = vec![0u8; ProtocolConfig::READ_CHUNK_SIZE];

        loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    let n = result?;
                    if n == 0 {
                        return Ok(()); // Peer closed
                    }
                    if inbound_tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        return Ok(()); // Stream dropped
                    }
                }
                message = outbound_rx.recv() => {
                    match message {
                        Some(data) => writer.write_all(&data).await?,
                        None => {
                            writer.shutdown().await?;
                            return Ok(());
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            }
        }
    }
}

impl Listener for TcpListener {
    fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let handle = self.runtime()?;
        let std_listener = std::net::TcpListener::bind((self.address.as_str(), self.port))?;
        std_listener.set_nonblocking(true)?;
        let addr = std_listener.local_addr()?;
        let listener = {
            let _guard = handle.enter();
            tokio::net::TcpListener::from_std(std_listener)?
        };

        info!("{} server listening on {}", self.name, addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        handle.spawn(Self::accept_loop(
            self.name,
            listener,
            accepted_tx,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        self.running = Some(Running {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            accepted_rx,
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut running) = self.running.take() {
            if let Some(tx) = running.shutdown_tx.take() {
                let _ = tx.send(());
            }
            let _ = running.conn_shutdown_tx.send(true);
        }
    }

    fn running(&self) -> bool {
        self.running.is_some()
    }

    fn poll_accept(&mut self) -> Option<Box<dyn ByteStream>> {
        let running = self.running.as_mut()?;
        running
            .accepted_rx
            .try_recv()
            .ok()
            .map(|stream| Box::new(stream) as Box<dyn ByteStream>)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.addr)
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn accept(listener: &mut TcpListener) -> Box<dyn ByteStream> {
        for _ in 0..200 {
            if let Some(stream) = listener.poll_accept() {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no connection accepted");
    }

    async fn wait_for_data(stream: &mut Box<dyn ByteStream>, len: usize) {
        for _ in 0..200 {
            if stream.data_available() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("data did not arrive");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tcp_round_trip() {
        let mut listener = TcpListener::new("RPC", "127.0.0.1", 0);
        listener.start().unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut stream = accept(&mut listener).await;

        client.write_all(b"ping").await.unwrap();
        wait_for_data(&mut stream, 4).await;
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        stream.write(b"pong").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        assert_eq!(stream.bytes_written(), 4);

        listener.stop();
        assert!(!listener.running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_flushes_then_disconnects() {
        let mut listener = TcpListener::new("RPC", "127.0.0.1", 0);
        listener.start().unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut stream = accept(&mut listener).await;
        stream.write(b"bye").unwrap();
        stream.close();
        assert!(!stream.connected());

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye".to_vec());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_close_is_disconnect() {
        let mut listener = TcpListener::new("RPC", "127.0.0.1", 0);
        listener.start().unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let mut stream = accept(&mut listener).await;
        drop(client);

        let mut buf = [0u8; 1];
        for _ in 0..200 {
            if stream.read(&mut buf).is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("disconnect not observed");
    }
}

//! Byte transports.
//!
//! The update loop only ever sees non-blocking byte streams: a listener hands
//! out accepted [`ByteStream`]s, and the engine polls them from the tick
//! thread. [`memory`] provides an in-process pair for tests and embedding,
//! [`tcp`] a tokio-backed TCP listener.

pub mod memory;
pub mod tcp;

use crate::Result;
use std::net::SocketAddr;

/// Ordered, non-blocking byte stream to one client.
pub trait ByteStream: Send {
    /// Number of bytes that can be read right now without blocking.
    fn data_available(&mut self) -> usize;

    /// Read up to `buf.len()` available bytes. Returns 0 when nothing is
    /// available; fails with `ClientDisconnected` once the peer has gone and
    /// every buffered byte has been read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Queue `data` for sending.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn close(&mut self);

    fn connected(&self) -> bool;

    fn peer_address(&self) -> String;

    fn bytes_read(&self) -> u64;

    fn bytes_written(&self) -> u64;
}

/// Source of newly accepted connections for one channel.
pub trait Listener: Send {
    fn start(&mut self) -> Result<()>;

    /// Stop accepting and drop connections not yet taken by `poll_accept`.
    fn stop(&mut self);

    fn running(&self) -> bool;

    /// Take the next accepted connection, if any.
    fn poll_accept(&mut self) -> Option<Box<dyn ByteStream>>;

    /// Bound address, for listeners that have one.
    fn local_addr(&self) -> Option<SocketAddr>;
}

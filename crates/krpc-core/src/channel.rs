//! Per-client message channels.
//!
//! Steady-state messages are framed as a varint length followed by the
//! message bytes. The request reader keeps partial frames across polls and
//! always drains frames it has already buffered before reading more, so
//! back-to-back requests in one read are all served.

use crate::codec::wire::{frame, WireReader, MAX_VARINT_LENGTH};
use crate::config::ProtocolConfig;
use crate::messages::{Request, Response, StreamMessage, WireMessage};
use crate::transport::ByteStream;
use crate::{CodecError, KrpcError, Result};
use bytes::{Buf, BytesMut};

/// Reassembles length-prefixed Requests from a byte stream.
#[derive(Debug, Default)]
pub struct RequestReader {
    buffer: BytesMut,
}

impl RequestReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet consumed by a complete Request.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append raw bytes, as if read from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode a Request from the buffered bytes if a whole frame is present.
    pub fn try_decode(&mut self) -> Result<Option<Request>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let mut reader = WireReader::new(&self.buffer);
        let length = match reader.read_varint() {
            Ok(length) => length,
            Err(CodecError::Truncated { .. }) => return Ok(None),
            Err(e) => {
                return Err(KrpcError::MalformedRequest {
                    message: e.to_string(),
                })
            }
        };
        let limit = ProtocolConfig::REQUEST_BUFFER_SIZE;
        let size = usize::try_from(length).unwrap_or(usize::MAX);
        if size > limit {
            return Err(KrpcError::RequestTooLarge { size, limit });
        }
        let prefix = self.buffer.len() - reader.remaining();
        if reader.remaining() < size {
            return Ok(None);
        }
        let request = Request::decode(&self.buffer[prefix..prefix + size]).map_err(|e| {
            KrpcError::MalformedRequest {
                message: e.to_string(),
            }
        })?;
        self.buffer.advance(prefix + size);
        Ok(Some(request))
    }

    /// Return the next Request, reading from `stream` only when the buffer
    /// does not already hold one. Everything the transport has available
    /// is drained, up to one maximum-size frame.
    pub fn poll(&mut self, stream: &mut dyn ByteStream) -> Result<Option<Request>> {
        let capacity = ProtocolConfig::REQUEST_BUFFER_SIZE + MAX_VARINT_LENGTH;
        loop {
            if let Some(request) = self.try_decode()? {
                return Ok(Some(request));
            }
            let available = stream.data_available();
            let room = capacity.saturating_sub(self.buffer.len());
            if available == 0 || room == 0 {
                return Ok(None);
            }
            let mut chunk = vec![0u8; available.min(room)];
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Request/response channel of a connected RPC client.
pub struct RequestChannel {
    stream: Box<dyn ByteStream>,
    reader: RequestReader,
}

impl RequestChannel {
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        Self {
            stream,
            reader: RequestReader::new(),
        }
    }

    /// Whether a poll could make progress: buffered bytes or transport data.
    pub fn has_data(&mut self) -> bool {
        self.reader.buffered() > 0 || self.stream.data_available() > 0
    }

    pub fn poll_request(&mut self) -> Result<Option<Request>> {
        self.reader.poll(self.stream.as_mut())
    }

    pub fn send_response(&mut self, response: &Response) -> Result<()> {
        self.stream.write(&frame(&response.encode()))
    }

    pub fn close(&mut self) {
        self.stream.close();
    }

    pub fn connected(&self) -> bool {
        self.stream.connected()
    }

    pub fn address(&self) -> String {
        self.stream.peer_address()
    }

    pub fn bytes_read(&self) -> u64 {
        self.stream.bytes_read()
    }

    pub fn bytes_written(&self) -> u64 {
        self.stream.bytes_written()
    }
}

/// Outbound-only channel of a connected stream client.
pub struct StreamChannel {
    stream: Box<dyn ByteStream>,
}

impl StreamChannel {
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        Self { stream }
    }

    pub fn send(&mut self, message: &StreamMessage) -> Result<()> {
        self.stream.write(&frame(&message.encode()))
    }

    /// Discard anything the client sent; the stream channel is one-way.
    pub fn discard_input(&mut self) {
        let available = self.stream.data_available();
        if available > 0 {
            let mut sink = vec![0u8; available];
            let _ = self.stream.read(&mut sink);
        }
    }

    pub fn close(&mut self) {
        self.stream.close();
    }

    pub fn connected(&self) -> bool {
        self.stream.connected()
    }

    pub fn address(&self) -> String {
        self.stream.peer_address()
    }

    pub fn bytes_read(&self) -> u64 {
        self.stream.bytes_read()
    }

    pub fn bytes_written(&self) -> u64 {
        self.stream.bytes_written()
    }
}

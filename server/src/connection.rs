//! Per-connection state: the packet framer and command handlers.
//!
//! A connection accumulates raw bytes handed over by the event loop until a
//! complete request packet is assembled, dispatches it against the cache,
//! and writes the response back on the socket synchronously. The buffer is
//! reset between packets.

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use lru_cache::{Entry, LruCache};
use protocol_memcache::{
    Opcode, RequestHeader, ResponseHeader, Status, HEADER_LEN, REQUEST_MAGIC,
};
use tracing::{debug, warn};

use crate::metrics::Stats;

/// Connection state owned by the pinned executor.
///
/// The event loop keeps its own registered half of the socket for readiness
/// notification; this writer is a duplicated descriptor used only for
/// responses. Dropping the connection half-closes the socket so the event
/// loop observes EOF and releases its registration.
pub struct Connection {
    writer: TcpStream,
    cache: Arc<LruCache>,
    stats: Arc<Stats>,
    executor_index: usize,
    /// Bytes of the in-progress request. Empty between packets.
    request: BytesMut,
    /// Decoded header of the in-progress request, once 24 bytes arrived.
    header: Option<RequestHeader>,
}

impl Connection {
    pub fn new(
        writer: TcpStream,
        cache: Arc<LruCache>,
        stats: Arc<Stats>,
        executor_index: usize,
    ) -> Self {
        Connection {
            writer,
            cache,
            stats,
            executor_index,
            request: BytesMut::new(),
            header: None,
        }
    }

    /// Index of the executor this connection is pinned to.
    pub fn executor_index(&self) -> usize {
        self.executor_index
    }

    /// Buffer an incoming chunk, dispatching once a whole packet is
    /// assembled.
    ///
    /// Returns `false` when the connection should be torn down: the first
    /// byte of a fresh request is not the request magic (no response is
    /// written), the buffer holds bytes past the declared body, or a
    /// response write failed.
    pub fn ingest(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }

        // A fresh request must open with the request magic.
        if self.request.is_empty() && data[0] != REQUEST_MAGIC {
            self.stats.inc_protocol_errors();
            debug!(byte = data[0], "bad request magic, closing connection");
            return false;
        }

        self.request.extend_from_slice(data);

        if self.request.len() < HEADER_LEN {
            return true;
        }

        let header = match self.header {
            Some(header) => header,
            None => {
                let header = RequestHeader::decode(&self.request[..HEADER_LEN]);
                if let Err(status) = header.validate() {
                    self.stats.inc_protocol_errors();
                    self.write_error(&header, status);
                    return true;
                }
                self.header = Some(header);
                header
            }
        };

        let total = header.total_len();
        if self.request.len() < total {
            return true;
        }

        if self.request.len() > total {
            // Bytes past the declared body; the framer does not support
            // pipelined packets within one buffer.
            self.stats.inc_protocol_errors();
            self.write_error(&header, Status::InvalidArguments);
            return false;
        }

        let keep_open = self.process_packet(&header);
        self.reset();
        keep_open
    }

    fn process_packet(&mut self, header: &RequestHeader) -> bool {
        match Opcode::from_u8(header.opcode) {
            Some(Opcode::Set) => self.handle_set(header),
            Some(Opcode::Get) => self.handle_get(header),
            Some(Opcode::Delete) => self.handle_delete(header),
            None => {
                // validate() already rejects unknown opcodes; kept for the
                // dispatch to be total.
                self.write_error(header, Status::UnknownCommand);
                true
            }
        }
    }

    fn handle_set(&mut self, header: &RequestHeader) -> bool {
        self.stats.inc_sets();

        // Ownership of the raw packet moves into the cache; no copy.
        let packet = self.request.split().freeze();
        let entry = match Entry::new(packet, *header) {
            Ok(entry) => entry,
            Err(_) => {
                self.write_error(header, Status::InvalidArguments);
                return true;
            }
        };

        if header.cas > 0 {
            if !self.cache.cas(entry, header.cas) {
                self.write_error(header, Status::KeyExists);
                return true;
            }
        } else {
            self.cache.set(entry);
        }

        let mut response = BytesMut::with_capacity(HEADER_LEN);
        ResponseHeader::for_request(header, Status::NoError, 0, 0).encode(&mut response);
        self.write_response(&response)
    }

    fn handle_get(&mut self, header: &RequestHeader) -> bool {
        self.stats.inc_gets();

        let entry = {
            let start = header.key_offset();
            let key = &self.request[start..start + header.keylen as usize];
            self.cache.get(key)
        };

        let entry = match entry {
            Some(entry) => entry,
            None => {
                self.stats.inc_misses();
                self.write_error(header, Status::KeyNotFound);
                return true;
            }
        };
        self.stats.inc_hits();

        // Body: 4-byte flags (always zero) followed by the stored value.
        let value = entry.value();
        let flags: u32 = 0;
        let bodylen = (std::mem::size_of::<u32>() + value.len()) as u32;

        let mut response = BytesMut::with_capacity(HEADER_LEN + bodylen as usize);
        ResponseHeader::for_request(header, Status::NoError, 4, bodylen).encode(&mut response);
        response.put_u32(flags);
        response.extend_from_slice(value);
        self.write_response(&response)
    }

    fn handle_delete(&mut self, header: &RequestHeader) -> bool {
        self.stats.inc_deletes();

        let removed = {
            let start = header.key_offset();
            let key = &self.request[start..start + header.keylen as usize];
            self.cache.remove(key, header.cas)
        };

        if !removed {
            self.write_error(header, Status::KeyExists);
            return true;
        }

        let mut response = BytesMut::with_capacity(HEADER_LEN);
        ResponseHeader::for_request(header, Status::NoError, 0, 0).encode(&mut response);
        self.write_response(&response)
    }

    /// Write an error response whose body is the status's diagnostic
    /// string, then reset the framer.
    fn write_error(&mut self, header: &RequestHeader, status: Status) {
        let message = status.message();

        let mut response = BytesMut::with_capacity(HEADER_LEN + message.len());
        ResponseHeader::for_request(header, status, 0, message.len() as u32)
            .encode(&mut response);
        response.extend_from_slice(message.as_bytes());

        self.write_response(&response);
        self.reset();
    }

    /// Write the whole buffer, retrying on EAGAIN.
    ///
    /// Returns `false` on any other write error; the caller tears the
    /// connection down.
    fn write_response(&mut self, buf: &[u8]) -> bool {
        let mut rest = buf;
        while !rest.is_empty() {
            match self.writer.write(rest) {
                Ok(0) => {
                    warn!("response write returned zero, closing connection");
                    return false;
                }
                Ok(n) => rest = &rest[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "response write failed, closing connection");
                    return false;
                }
            }
        }
        true
    }

    fn reset(&mut self) {
        self.request.clear();
        self.header = None;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Half-close so the event loop's registered descriptor reads EOF.
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

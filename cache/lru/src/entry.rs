//! Cache entry: one stored key/value record plus metadata.

use bytes::Bytes;
use protocol_memcache::{RequestHeader, HEADER_LEN};

use crate::error::CacheError;

/// A cached record.
///
/// An entry owns the full raw request packet it was stored from (header,
/// extras, key, value) together with a cached copy of the decoded header.
/// Key, extras, and value are views into the packet buffer; no separate
/// copies are made.
///
/// Entries are shared via `Arc`: a reader holding an entry returned from a
/// lookup keeps its storage alive even after the entry is evicted or
/// deleted from the cache.
#[derive(Debug)]
pub struct Entry {
    packet: Bytes,
    header: RequestHeader,
    /// Index of this entry's node in the LRU list. Assigned on insert.
    lru_node: usize,
}

impl Entry {
    /// Build an entry from a stored packet and its decoded header.
    ///
    /// The packet must contain the complete body the header declares and
    /// the key must lie within it.
    pub fn new(packet: Bytes, header: RequestHeader) -> Result<Self, CacheError> {
        if packet.len() < header.total_len() || packet.len() < HEADER_LEN {
            return Err(CacheError::PacketTruncated);
        }
        if header.key_offset() + header.keylen as usize > packet.len() {
            return Err(CacheError::KeyOutOfBounds);
        }

        Ok(Entry {
            packet,
            header,
            lru_node: usize::MAX,
        })
    }

    /// The key, as a cheap view into the stored packet.
    pub fn key(&self) -> Bytes {
        let start = self.header.key_offset();
        self.packet.slice(start..start + self.header.keylen as usize)
    }

    /// The value bytes.
    pub fn value(&self) -> &[u8] {
        let start = self.header.key_offset() + self.header.keylen as usize;
        &self.packet[start..self.header.total_len()]
    }

    /// The extras section of the stored packet.
    pub fn extras(&self) -> &[u8] {
        &self.packet[HEADER_LEN..HEADER_LEN + self.header.extlen as usize]
    }

    /// Length of the stored packet; the unit of capacity accounting.
    pub fn packet_len(&self) -> usize {
        self.packet.len()
    }

    /// CAS token carried in the header at insert time.
    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    /// The decoded request header this entry was stored from.
    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    pub(crate) fn lru_node(&self) -> usize {
        self.lru_node
    }

    pub(crate) fn set_lru_node(&mut self, node: usize) {
        self.lru_node = node;
    }
}

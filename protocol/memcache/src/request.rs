//! Client-side request encoding for the Memcache binary protocol.
//!
//! Used by tests and client tooling to build well-formed request packets.

use bytes::{BufMut, BytesMut};

use crate::{Opcode, RequestHeader, REQUEST_MAGIC, SET_EXTRAS_LEN};

/// A request builder for encoding binary protocol commands.
#[derive(Debug, Clone)]
pub enum Request<'a> {
    /// GET: body is the key.
    Get { key: &'a [u8], opaque: u32 },
    /// SET: body is 8 bytes of extras (flags + expiration, zeroed), key, value.
    Set {
        key: &'a [u8],
        value: &'a [u8],
        cas: u64,
        opaque: u32,
    },
    /// DELETE: body is the key; CAS token optionally guards the removal.
    Delete {
        key: &'a [u8],
        cas: u64,
        opaque: u32,
    },
}

impl<'a> Request<'a> {
    /// Create a GET request.
    #[inline]
    pub fn get(key: &'a [u8]) -> Self {
        Request::Get { key, opaque: 0 }
    }

    /// Create a SET request.
    #[inline]
    pub fn set(key: &'a [u8], value: &'a [u8]) -> SetRequest<'a> {
        SetRequest {
            key,
            value,
            cas: 0,
            opaque: 0,
        }
    }

    /// Create a DELETE request.
    #[inline]
    pub fn delete(key: &'a [u8]) -> DeleteRequest<'a> {
        DeleteRequest {
            key,
            cas: 0,
            opaque: 0,
        }
    }

    /// Set the opaque value echoed back in the response.
    #[inline]
    pub fn opaque(mut self, opaque: u32) -> Self {
        match &mut self {
            Request::Get { opaque: o, .. }
            | Request::Set { opaque: o, .. }
            | Request::Delete { opaque: o, .. } => *o = opaque,
        }
        self
    }

    /// Encode this request into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Request::Get { key, opaque } => {
                encode_keyed(buf, Opcode::Get, key, 0, *opaque);
            }
            Request::Set {
                key,
                value,
                cas,
                opaque,
            } => {
                let header = RequestHeader {
                    magic: REQUEST_MAGIC,
                    opcode: Opcode::Set as u8,
                    keylen: key.len() as u16,
                    extlen: SET_EXTRAS_LEN as u8,
                    datatype: 0,
                    vbucket: 0,
                    bodylen: (SET_EXTRAS_LEN + key.len() + value.len()) as u32,
                    opaque: *opaque,
                    cas: *cas,
                };
                header.encode(buf);
                buf.put_bytes(0, SET_EXTRAS_LEN);
                buf.extend_from_slice(key);
                buf.extend_from_slice(value);
            }
            Request::Delete { key, cas, opaque } => {
                encode_keyed(buf, Opcode::Delete, key, *cas, *opaque);
            }
        }
    }
}

/// Encode a request whose body is just the key (GET, DELETE).
fn encode_keyed(buf: &mut BytesMut, opcode: Opcode, key: &[u8], cas: u64, opaque: u32) {
    let header = RequestHeader {
        magic: REQUEST_MAGIC,
        opcode: opcode as u8,
        keylen: key.len() as u16,
        extlen: 0,
        datatype: 0,
        vbucket: 0,
        bodylen: key.len() as u32,
        opaque,
        cas,
    };
    header.encode(buf);
    buf.extend_from_slice(key);
}

/// Builder for SET requests with optional CAS token and opaque.
#[derive(Debug, Clone)]
pub struct SetRequest<'a> {
    key: &'a [u8],
    value: &'a [u8],
    cas: u64,
    opaque: u32,
}

impl<'a> SetRequest<'a> {
    /// Set the CAS token carried in the request header.
    #[inline]
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Set the opaque value echoed back in the response.
    #[inline]
    pub fn opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// Build the final request.
    #[inline]
    pub fn build(self) -> Request<'a> {
        Request::Set {
            key: self.key,
            value: self.value,
            cas: self.cas,
            opaque: self.opaque,
        }
    }

    /// Encode this request directly into `buf`.
    #[inline]
    pub fn encode(self, buf: &mut BytesMut) {
        self.build().encode(buf)
    }
}

/// Builder for DELETE requests with optional CAS token and opaque.
#[derive(Debug, Clone)]
pub struct DeleteRequest<'a> {
    key: &'a [u8],
    cas: u64,
    opaque: u32,
}

impl<'a> DeleteRequest<'a> {
    /// Set the CAS token guarding the removal.
    #[inline]
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Set the opaque value echoed back in the response.
    #[inline]
    pub fn opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// Build the final request.
    #[inline]
    pub fn build(self) -> Request<'a> {
        Request::Delete {
            key: self.key,
            cas: self.cas,
            opaque: self.opaque,
        }
    }

    /// Encode this request directly into `buf`.
    #[inline]
    pub fn encode(self, buf: &mut BytesMut) {
        self.build().encode(buf)
    }
}

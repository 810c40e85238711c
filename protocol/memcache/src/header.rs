//! Request and response header encoding.

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    Opcode, Status, HEADER_LEN, MAX_KEY_LEN, MAX_VALUE_LEN, REQUEST_MAGIC, RESPONSE_MAGIC,
    SET_EXTRAS_LEN,
};

/// A decoded request header with host-endian fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub magic: u8,
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub datatype: u8,
    pub vbucket: u16,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Decode a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_LEN`].
    pub fn decode(buf: &[u8]) -> Self {
        let mut buf = &buf[..HEADER_LEN];
        RequestHeader {
            magic: buf.get_u8(),
            opcode: buf.get_u8(),
            keylen: buf.get_u16(),
            extlen: buf.get_u8(),
            datatype: buf.get_u8(),
            vbucket: buf.get_u16(),
            bodylen: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        }
    }

    /// Encode this header in wire order.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.keylen);
        buf.put_u8(self.extlen);
        buf.put_u8(self.datatype);
        buf.put_u16(self.vbucket);
        buf.put_u32(self.bodylen);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    /// Total packet length, header included.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.bodylen as usize
    }

    /// Offset of the key within the packet.
    pub fn key_offset(&self) -> usize {
        HEADER_LEN + self.extlen as usize
    }

    /// Length of the value portion of the body.
    pub fn value_len(&self) -> usize {
        self.bodylen as usize - self.extlen as usize - self.keylen as usize
    }

    /// Validate field combinations for the declared opcode.
    ///
    /// A zero-length key fails with [`Status::TooLarge`] before any opcode
    /// check; this mirrors the protocol behavior memcache clients expect
    /// from this server.
    pub fn validate(&self) -> Result<Opcode, Status> {
        if self.keylen == 0 {
            return Err(Status::TooLarge);
        }

        let opcode = match Opcode::from_u8(self.opcode) {
            Some(opcode) => opcode,
            None => return Err(Status::UnknownCommand),
        };

        match opcode {
            Opcode::Get | Opcode::Delete => {
                if self.extlen != 0 || self.bodylen != u32::from(self.keylen) {
                    return Err(Status::InvalidArguments);
                }
            }
            Opcode::Set => {
                let keylen = self.keylen as usize;
                let bodylen = self.bodylen as usize;
                if self.extlen as usize != SET_EXTRAS_LEN
                    || bodylen < keylen + SET_EXTRAS_LEN
                    || keylen > MAX_KEY_LEN
                {
                    return Err(Status::InvalidArguments);
                }
                if bodylen > MAX_VALUE_LEN + keylen + SET_EXTRAS_LEN {
                    return Err(Status::TooLarge);
                }
            }
        }

        Ok(opcode)
    }
}

/// A response header with host-endian fields.
///
/// Responses copy the opcode and opaque of the request they answer and echo
/// the request's CAS token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub magic: u8,
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub datatype: u8,
    pub status: u16,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    /// Build a response header answering `request`.
    pub fn for_request(
        request: &RequestHeader,
        status: Status,
        extlen: u8,
        bodylen: u32,
    ) -> Self {
        ResponseHeader {
            magic: RESPONSE_MAGIC,
            opcode: request.opcode,
            keylen: 0,
            extlen,
            datatype: 0,
            status: status.code(),
            bodylen,
            opaque: request.opaque,
            cas: request.cas,
        }
    }

    /// Encode this header in wire order.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.keylen);
        buf.put_u8(self.extlen);
        buf.put_u8(self.datatype);
        buf.put_u16(self.status);
        buf.put_u32(self.bodylen);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    /// Decode a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_LEN`].
    pub fn decode(buf: &[u8]) -> Self {
        let mut buf = &buf[..HEADER_LEN];
        ResponseHeader {
            magic: buf.get_u8(),
            opcode: buf.get_u8(),
            keylen: buf.get_u16(),
            extlen: buf.get_u8(),
            datatype: buf.get_u8(),
            status: buf.get_u16(),
            bodylen: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_header(keylen: u16, valuelen: u32, cas: u64) -> RequestHeader {
        RequestHeader {
            magic: REQUEST_MAGIC,
            opcode: Opcode::Set as u8,
            keylen,
            extlen: SET_EXTRAS_LEN as u8,
            datatype: 0,
            vbucket: 0,
            bodylen: u32::from(keylen) + SET_EXTRAS_LEN as u32 + valuelen,
            opaque: 0,
            cas,
        }
    }

    #[test]
    fn request_header_round_trip() {
        let header = RequestHeader {
            magic: REQUEST_MAGIC,
            opcode: Opcode::Set as u8,
            keylen: 3,
            extlen: 8,
            datatype: 0,
            vbucket: 0,
            bodylen: 16,
            opaque: 0xdead_beef,
            cas: 0x0102_0304_0506_0708,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(RequestHeader::decode(&buf), header);
    }

    #[test]
    fn wire_fields_are_big_endian() {
        let header = set_header(0x0102, 1, 0);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf[0], REQUEST_MAGIC);
        // keylen at offset 2..4
        assert_eq!(&buf[2..4], &[0x01, 0x02]);
        // bodylen at offset 8..12
        let bodylen = 0x0102 + 8 + 1;
        assert_eq!(&buf[8..12], &u32::to_be_bytes(bodylen));
    }

    #[test]
    fn response_echoes_request_fields() {
        let request = RequestHeader {
            magic: REQUEST_MAGIC,
            opcode: Opcode::Get as u8,
            keylen: 2,
            extlen: 0,
            datatype: 0,
            vbucket: 0,
            bodylen: 2,
            opaque: 42,
            cas: 999,
        };

        let response = ResponseHeader::for_request(&request, Status::NoError, 4, 6);
        assert_eq!(response.magic, RESPONSE_MAGIC);
        assert_eq!(response.opcode, request.opcode);
        assert_eq!(response.opaque, 42);
        assert_eq!(response.cas, 999);
        assert_eq!(response.extlen, 4);
        assert_eq!(response.bodylen, 6);
        assert_eq!(response.status, 0);

        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(ResponseHeader::decode(&buf), response);
    }

    #[test]
    fn validate_accepts_well_formed_requests() {
        assert_eq!(set_header(3, 5, 0).validate(), Ok(Opcode::Set));

        let get = RequestHeader {
            magic: REQUEST_MAGIC,
            opcode: Opcode::Get as u8,
            keylen: 3,
            extlen: 0,
            datatype: 0,
            vbucket: 0,
            bodylen: 3,
            opaque: 0,
            cas: 0,
        };
        assert_eq!(get.validate(), Ok(Opcode::Get));

        let delete = RequestHeader {
            opcode: Opcode::Delete as u8,
            ..get
        };
        assert_eq!(delete.validate(), Ok(Opcode::Delete));
    }

    #[test]
    fn validate_rejects_zero_keylen_as_too_large() {
        let mut header = set_header(0, 5, 0);
        header.bodylen = 13;
        assert_eq!(header.validate(), Err(Status::TooLarge));
    }

    #[test]
    fn validate_rejects_unknown_opcode() {
        let mut header = set_header(3, 5, 0);
        header.opcode = 0x20;
        assert_eq!(header.validate(), Err(Status::UnknownCommand));
    }

    #[test]
    fn validate_rejects_malformed_get() {
        let mut get = RequestHeader {
            magic: REQUEST_MAGIC,
            opcode: Opcode::Get as u8,
            keylen: 3,
            extlen: 4,
            datatype: 0,
            vbucket: 0,
            bodylen: 7,
            opaque: 0,
            cas: 0,
        };
        assert_eq!(get.validate(), Err(Status::InvalidArguments));

        get.extlen = 0;
        get.bodylen = 4; // != keylen
        assert_eq!(get.validate(), Err(Status::InvalidArguments));
    }

    #[test]
    fn validate_rejects_malformed_set() {
        // wrong extras length
        let mut header = set_header(3, 5, 0);
        header.extlen = 0;
        assert_eq!(header.validate(), Err(Status::InvalidArguments));

        // body shorter than key + extras
        let mut header = set_header(3, 5, 0);
        header.bodylen = 10;
        assert_eq!(header.validate(), Err(Status::InvalidArguments));

        // oversized key
        let header = set_header(MAX_KEY_LEN as u16 + 1, 5, 0);
        assert_eq!(header.validate(), Err(Status::InvalidArguments));
    }

    #[test]
    fn validate_rejects_oversized_value() {
        let header = set_header(3, MAX_VALUE_LEN as u32 + 1, 0);
        assert_eq!(header.validate(), Err(Status::TooLarge));

        // exactly at the limit is accepted
        let header = set_header(3, MAX_VALUE_LEN as u32, 0);
        assert_eq!(header.validate(), Ok(Opcode::Set));
    }
}

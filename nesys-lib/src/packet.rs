use crate::auth;
use crate::constants::{AUTH_TAG_SIZE, HEADER_SIZE, MAX_BODY_SIZE, TIMESTAMP_SIZE};
use crate::error::NesysError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

/// Message ids understood by the profile server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum MessageId {
    Success = 0x0000,
    BadDecode = 0x0010,
    AuthFailed = 0x0011,
    Ping = 0x00FF,

    GetProfile = 0x0100,
    SetProfile = 0x0101,
    GetCars = 0x0102,
    NewProfile = 0x0110,
    ProfileExists = 0x0111,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// The 6-byte header that starts every frame.
///
/// Layout: 2-byte big-endian id, 1 byte whose bit 0 is `has_hmac`, 1 byte
/// whose bit 0 is `has_timestamp`, 2-byte big-endian body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_id: MessageId,
    pub has_hmac: bool,
    pub has_timestamp: bool,
    pub body_len: u16,
}

impl Header {
    pub fn new(message_id: MessageId, has_hmac: bool, has_timestamp: bool, body_len: u16) -> Self {
        Self {
            message_id,
            has_hmac,
            has_timestamp,
            body_len,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u16(self.message_id.into());
        buf.put_u8(self.has_hmac as u8);
        buf.put_u8(self.has_timestamp as u8);
        buf.put_u16(self.body_len);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NesysError> {
        if bytes.len() < HEADER_SIZE {
            return Err(NesysError::MalformedHeader {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut buf = &bytes[..HEADER_SIZE];
        Ok(Self {
            message_id: MessageId::from_primitive(buf.get_u16()),
            has_hmac: buf.get_u8() & 1 == 1,
            has_timestamp: buf.get_u8() & 1 == 1,
            body_len: buf.get_u16(),
        })
    }

    /// Number of bytes covered by the auth tag (everything before it)
    pub fn signed_size(&self) -> usize {
        HEADER_SIZE + self.body_len as usize + if self.has_timestamp { TIMESTAMP_SIZE } else { 0 }
    }

    /// Exact number of bytes the framed message occupies on the wire
    pub fn total_wire_size(&self) -> usize {
        self.signed_size() + if self.has_hmac { AUTH_TAG_SIZE } else { 0 }
    }
}

/// A complete request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub body: Bytes,
    pub timestamp: Option<i64>,
    pub auth_tag: Option<[u8; AUTH_TAG_SIZE]>,
}

impl Message {
    pub fn new(id: MessageId, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
            timestamp: None,
            auth_tag: None,
        }
    }

    pub fn header(&self) -> Header {
        Header::new(
            self.id,
            self.auth_tag.is_some(),
            self.timestamp.is_some(),
            self.body.len() as u16,
        )
    }

    /// Attach a millisecond timestamp. Any existing tag no longer covers
    /// the message and is dropped.
    pub fn with_timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self.auth_tag = None;
        self
    }

    /// Compute the auth tag over the header (with `has_hmac` set), body and
    /// timestamp.
    pub fn signed(mut self, key: &[u8]) -> Result<Self, NesysError> {
        self.check_body()?;
        let region = self.signed_region(true);
        self.auth_tag = Some(auth::sign(key, &region));
        Ok(self)
    }

    /// Check the stored tag against `key`. Unsigned messages never verify.
    pub fn verify(&self, key: &[u8]) -> bool {
        match &self.auth_tag {
            Some(tag) => auth::verify(key, &self.signed_region(true), tag),
            None => false,
        }
    }

    pub fn encode(&self) -> Result<Bytes, NesysError> {
        self.check_body()?;
        let mut out = self.signed_region(self.auth_tag.is_some());
        if let Some(tag) = &self.auth_tag {
            out.put_slice(tag);
        }
        Ok(out.freeze())
    }

    /// Decode one complete frame. Trailing bytes past the frame are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self, NesysError> {
        let header = Header::decode(frame)?;
        let total = header.total_wire_size();
        if frame.len() < total {
            return Err(NesysError::Truncated {
                expected: total,
                actual: frame.len(),
            });
        }

        let mut buf = &frame[HEADER_SIZE..total];
        let body = Bytes::copy_from_slice(&buf[..header.body_len as usize]);
        buf.advance(header.body_len as usize);

        let timestamp = header.has_timestamp.then(|| buf.get_i64());
        let auth_tag = if header.has_hmac {
            let mut tag = [0u8; AUTH_TAG_SIZE];
            buf.copy_to_slice(&mut tag);
            Some(tag)
        } else {
            None
        };

        Ok(Self {
            id: header.message_id,
            body,
            timestamp,
            auth_tag,
        })
    }

    fn check_body(&self) -> Result<(), NesysError> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(NesysError::FieldTooLong {
                field: "body",
                len: self.body.len(),
                max: MAX_BODY_SIZE,
            });
        }
        Ok(())
    }

    fn signed_region(&self, has_hmac: bool) -> BytesMut {
        let header = Header {
            has_hmac,
            ..self.header()
        };
        let mut out = BytesMut::with_capacity(header.total_wire_size());
        out.put_slice(&header.encode());
        out.put_slice(&self.body);
        if let Some(ts) = self.timestamp {
            out.put_i64(ts);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = Header::new(MessageId::GetProfile, true, false, 0x0123);
        assert_eq!(header.encode(), [0x01, 0x00, 0x01, 0x00, 0x01, 0x23]);

        let header = Header::new(MessageId::Ping, false, true, 0);
        assert_eq!(header.encode(), [0x00, 0xFF, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_header_decode_inverse() {
        let cases = [
            (MessageId::Success, false, false, 0u16),
            (MessageId::AuthFailed, true, true, 1),
            (MessageId::NewProfile, false, true, 16),
            (MessageId::Unknown(0xBEEF), true, false, u16::MAX),
        ];
        for (id, hmac, ts, len) in cases {
            let header = Header::new(id, hmac, ts, len);
            assert_eq!(Header::decode(&header.encode()).unwrap(), header);
        }
    }

    #[test]
    fn test_header_flags_use_bit_zero_only() {
        let header = Header::decode(&[0x00, 0x00, 0xFE, 0x03, 0x00, 0x00]).unwrap();
        assert!(!header.has_hmac);
        assert!(header.has_timestamp);
    }

    #[test]
    fn test_header_too_short() {
        for len in 0..HEADER_SIZE {
            let bytes = vec![0u8; len];
            match Header::decode(&bytes) {
                Err(NesysError::MalformedHeader { expected, actual }) => {
                    assert_eq!(expected, HEADER_SIZE);
                    assert_eq!(actual, len);
                }
                other => panic!("expected MalformedHeader for {len} bytes, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_total_wire_size_matches_encoding() {
        let key = b"secret";
        let plain = Message::new(MessageId::Ping, Bytes::new());
        assert_eq!(plain.encode().unwrap().len(), plain.header().total_wire_size());
        assert_eq!(plain.header().total_wire_size(), 6);

        let stamped = Message::new(MessageId::GetProfile, &b"abc"[..]).with_timestamp(42);
        assert_eq!(stamped.header().total_wire_size(), 6 + 3 + 8);
        assert_eq!(stamped.encode().unwrap().len(), 17);

        let signed = stamped.signed(key).unwrap();
        assert_eq!(signed.header().total_wire_size(), 6 + 3 + 8 + 32);
        assert_eq!(signed.encode().unwrap().len(), 49);
    }

    #[test]
    fn test_tag_is_last_and_covers_preceding_bytes() {
        let key = b"k3y";
        let msg = Message::new(MessageId::SetProfile, &b"payload"[..])
            .with_timestamp(1_600_000_000_000)
            .signed(key)
            .unwrap();
        let frame = msg.encode().unwrap();
        let (covered, tag) = frame.split_at(frame.len() - AUTH_TAG_SIZE);
        assert_eq!(covered[2], 1, "has_hmac bit is part of the signed bytes");
        assert!(auth::verify(key, covered, tag.try_into().unwrap()));
    }

    #[test]
    fn test_decode_signed_frame() {
        let key = b"k3y";
        let msg = Message::new(MessageId::Success, &b"BG04000000000001"[..])
            .with_timestamp(77)
            .signed(key)
            .unwrap();
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.verify(key));
        assert!(!decoded.verify(b"other"));
    }

    #[test]
    fn test_decode_truncated_frame() {
        let msg = Message::new(MessageId::Success, &b"abcdef"[..]).with_timestamp(1);
        let frame = msg.encode().unwrap();
        match Message::decode(&frame[..frame.len() - 1]) {
            Err(NesysError::Truncated { expected, actual }) => {
                assert_eq!(expected, frame.len());
                assert_eq!(actual, frame.len() - 1);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_body_rejected() {
        let msg = Message::new(MessageId::SetProfile, vec![0u8; MAX_BODY_SIZE + 1]);
        assert!(matches!(msg.encode(), Err(NesysError::FieldTooLong { .. })));
    }

    #[test]
    fn test_unknown_message_id() {
        let id = MessageId::from_primitive(0x0042);
        assert_eq!(id, MessageId::Unknown(0x0042));
        let raw: u16 = id.into();
        assert_eq!(raw, 0x0042);
        assert_eq!(MessageId::from_primitive(0x0011), MessageId::AuthFailed);
    }
}

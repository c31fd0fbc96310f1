use crate::error::NesysError;
use crate::packet::{Message, MessageId};
use crate::profile::CarProfile;
use crate::profile_id::ProfileId;
use bytes::{BufMut, Bytes, BytesMut};

/// High-level requests the client can send to the profile server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Liveness check, the response does not need to be authenticated
    Ping,
    /// Ask the server to allocate a fresh profile id
    NewProfile,
    /// Fetch the stored car profile for a profile id and plate
    GetProfile { profile_id: ProfileId, plate: String },
    /// Store a car profile for a profile id and plate
    SetProfile {
        profile_id: ProfileId,
        plate: String,
        profile: CarProfile,
    },
}

impl Request {
    pub fn message_id(&self) -> MessageId {
        match self {
            Request::Ping => MessageId::Ping,
            Request::NewProfile => MessageId::NewProfile,
            Request::GetProfile { .. } => MessageId::GetProfile,
            Request::SetProfile { .. } => MessageId::SetProfile,
        }
    }

    /// Whether the response must carry a valid auth tag
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Request::Ping)
    }

    /// Encode the request body.
    ///
    /// Profile requests carry a 1-byte length and the profile id text, a
    /// 1-byte length and the plate text, and for `SetProfile` a 2-byte
    /// big-endian length followed by the profile bytes.
    pub fn body(&self) -> Result<Bytes, NesysError> {
        let mut body = BytesMut::new();
        match self {
            Request::Ping | Request::NewProfile => {}
            Request::GetProfile { profile_id, plate } => {
                put_short_field(&mut body, "profile_id", &profile_id.encode())?;
                put_short_field(&mut body, "plate", plate.as_bytes())?;
            }
            Request::SetProfile {
                profile_id,
                plate,
                profile,
            } => {
                put_short_field(&mut body, "profile_id", &profile_id.encode())?;
                put_short_field(&mut body, "plate", plate.as_bytes())?;
                let data = profile.as_bytes();
                body.put_u16(data.len() as u16);
                body.put_slice(data);
            }
        }
        Ok(body.freeze())
    }

    /// Build the unsigned message for this request
    pub fn to_message(&self) -> Result<Message, NesysError> {
        Ok(Message::new(self.message_id(), self.body()?))
    }
}

fn put_short_field(body: &mut BytesMut, field: &'static str, value: &[u8]) -> Result<(), NesysError> {
    let len = u8::try_from(value.len()).map_err(|_| NesysError::FieldTooLong {
        field,
        len: value.len(),
        max: u8::MAX as usize,
    })?;
    body.put_u8(len);
    body.put_slice(value);
    Ok(())
}

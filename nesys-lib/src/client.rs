use crate::auth;
use crate::constants::{CAR_PROFILE_SIZE, HEADER_SIZE, RECEIVE_BUFFER_SIZE, REPLAY_WINDOW_MS, REQUEST_TIMEOUT};
use crate::error::{NesysError, classify_io};
use crate::message::Request;
use crate::packet::{Header, Message, MessageId};
use crate::profile::CarProfile;
use crate::profile_id::ProfileId;
use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Long-lived client state: where the server is, the shared key and the
/// replay-protection watermark.
pub struct ConnectionContext {
    key: Vec<u8>,
    server_address: String,
    port: u16,
    timeout: Duration,
    last_accepted_timestamp: i64,
}

impl ConnectionContext {
    pub fn new(key: impl Into<Vec<u8>>, server_address: impl Into<String>, port: u16) -> Self {
        Self {
            key: key.into(),
            server_address: server_address.into(),
            port,
            timeout: REQUEST_TIMEOUT,
            last_accepted_timestamp: now_millis() - REPLAY_WINDOW_MS,
        }
    }

    /// Override the connect/read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn last_accepted_timestamp(&self) -> i64 {
        self.last_accepted_timestamp
    }

    /// Timestamp and sign an outgoing message
    pub fn seal(&self, message: Message) -> Result<Message, NesysError> {
        message.with_timestamp(now_millis()).signed(&self.key)
    }

    /// Validate a complete response frame and dispatch on its message id.
    ///
    /// An authenticated response must carry a valid tag and a timestamp
    /// strictly newer than any previously accepted one. The watermark only
    /// moves once the response passed both checks.
    pub fn accept_response(&mut self, frame: &[u8], require_auth: bool) -> Result<Bytes, NesysError> {
        let message = Message::decode(frame)?;

        if let Some(tag) = &message.auth_tag {
            // The tag covers the bytes as received, flag bytes included
            let signed_size = Header::decode(frame)?.signed_size();
            if !auth::verify(&self.key, &frame[..signed_size], tag) {
                warn!("response auth tag does not match");
                return Err(NesysError::AuthRejectedByServer);
            }
            let Some(timestamp) = message.timestamp else {
                warn!("authenticated response carries no timestamp");
                return Err(NesysError::AuthRejectedByServer);
            };
            if timestamp <= self.last_accepted_timestamp {
                warn!(timestamp, last = self.last_accepted_timestamp, "stale response timestamp");
                return Err(NesysError::AuthRejectedByServer);
            }
            self.last_accepted_timestamp = timestamp;
        } else if require_auth {
            return Err(NesysError::AuthRejectedByServer);
        }

        match message.id {
            MessageId::Success => Ok(message.body),
            MessageId::AuthFailed => Err(NesysError::AuthRejectedByClient),
            other => Err(NesysError::ProtocolError(other.into())),
        }
    }
}

/// Client for the profile server. Every call opens a fresh connection.
pub struct ProfileClient {
    ctx: ConnectionContext,
    recv_buf: BytesMut,
}

impl ProfileClient {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self {
            ctx,
            recv_buf: BytesMut::with_capacity(RECEIVE_BUFFER_SIZE),
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Ping the server and return the round-trip time
    pub async fn ping(&mut self) -> Result<Duration, NesysError> {
        let started = Instant::now();
        self.send(&Request::Ping).await?;
        let round_trip = started.elapsed();
        debug!(round_trip_ms = round_trip.as_millis() as u64, "ping answered");
        Ok(round_trip)
    }

    /// Ask the server to allocate a new profile id
    pub async fn request_new_profile_id(&mut self) -> Result<ProfileId, NesysError> {
        let body = self.send(&Request::NewProfile).await?;
        ProfileId::decode(&body)
    }

    /// Fetch the stored profile. `None` means the server has nothing stored
    /// for this id and plate yet.
    pub async fn fetch_car_profile(
        &mut self,
        profile_id: ProfileId,
        plate: &str,
    ) -> Result<Option<CarProfile>, NesysError> {
        let body = self
            .send(&Request::GetProfile {
                profile_id,
                plate: plate.to_string(),
            })
            .await?;
        if body.is_empty() {
            return Ok(None);
        }
        if body.len() != CAR_PROFILE_SIZE {
            warn!(len = body.len(), "server returned an unexpected profile size");
        }
        Ok(Some(CarProfile::from_slice_lossy(&body)))
    }

    pub async fn store_car_profile(
        &mut self,
        profile_id: ProfileId,
        plate: &str,
        profile: &CarProfile,
    ) -> Result<(), NesysError> {
        self.send(&Request::SetProfile {
            profile_id,
            plate: plate.to_string(),
            profile: profile.clone(),
        })
        .await?;
        Ok(())
    }

    /// Perform one full request/response exchange
    pub async fn send(&mut self, request: &Request) -> Result<Bytes, NesysError> {
        let message = self.ctx.seal(request.to_message()?)?;
        let frame = message.encode()?;
        let limit = self.ctx.timeout;

        let address = (self.ctx.server_address.as_str(), self.ctx.port);
        let mut stream = timeout(limit, TcpStream::connect(address))
            .await?
            .map_err(classify_io)?;
        debug!(id = ?request.message_id(), len = frame.len(), "sending request");

        timeout(limit, stream.write_all(&frame)).await?.map_err(classify_io)?;

        self.receive(&mut stream, request.requires_auth()).await
    }

    async fn receive(&mut self, stream: &mut TcpStream, require_auth: bool) -> Result<Bytes, NesysError> {
        let limit = self.ctx.timeout;

        self.recv_buf.clear();
        self.recv_buf.resize(HEADER_SIZE, 0);
        timeout(limit, stream.read_exact(&mut self.recv_buf[..HEADER_SIZE]))
            .await?
            .map_err(classify_io)?;

        let header = Header::decode(&self.recv_buf)?;
        if require_auth && !header.has_hmac {
            warn!(id = ?header.message_id, "unauthenticated response to an authenticated request");
            return Err(NesysError::AuthRejectedByServer);
        }

        let total = header.total_wire_size();
        self.recv_buf.resize(total, 0);
        timeout(limit, stream.read_exact(&mut self.recv_buf[HEADER_SIZE..total]))
            .await?
            .map_err(classify_io)?;
        debug!(id = ?header.message_id, len = total, "received response");

        self.ctx.accept_response(&self.recv_buf[..total], require_auth)
    }
}

use crate::constants::{CAR_PROFILE_SIZE, DRESS_UP_RANGE};
use std::fmt;

/// The 304-byte car profile block exchanged between the server and the
/// target process. Contents are opaque apart from the dress-up range.
#[derive(Clone, PartialEq, Eq)]
pub struct CarProfile {
    bytes: [u8; CAR_PROFILE_SIZE],
}

impl CarProfile {
    pub fn zeroed() -> Self {
        Self {
            bytes: [0u8; CAR_PROFILE_SIZE],
        }
    }

    pub fn from_bytes(bytes: [u8; CAR_PROFILE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Copy `data` into a zeroed block. Shorter input leaves the tail zeroed,
    /// longer input is truncated.
    pub fn from_slice_lossy(data: &[u8]) -> Self {
        let mut profile = Self::zeroed();
        let len = data.len().min(CAR_PROFILE_SIZE);
        profile.bytes[..len].copy_from_slice(&data[..len]);
        profile
    }

    pub fn as_bytes(&self) -> &[u8; CAR_PROFILE_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; CAR_PROFILE_SIZE] {
        &mut self.bytes
    }

    /// The 37-byte dress-up sub-block, written separately once the process
    /// reports the car as tuned.
    pub fn dress_up(&self) -> &[u8] {
        &self.bytes[DRESS_UP_RANGE]
    }
}

impl Default for CarProfile {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for CarProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarProfile")
            .field("bytes", &hex::encode(self.bytes))
            .finish()
    }
}

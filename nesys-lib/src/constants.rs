// Protocol and layout constants for the profile server and id files

use std::ops::Range;
use std::time::Duration;

/// Size of the message header (id, flags, body length)
pub const HEADER_SIZE: usize = 6;

/// Size of the big-endian millisecond timestamp trailer
pub const TIMESTAMP_SIZE: usize = 8;

/// Size of the HMAC-SHA-256 tag trailer
pub const AUTH_TAG_SIZE: usize = 32;

/// Largest body the 16-bit length field can carry
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;

/// Initial capacity of the client receive buffer
pub const RECEIVE_BUFFER_SIZE: usize = 512;

/// Connect, read and write timeout for a single exchange
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

/// How far behind "now" the replay window starts for a fresh context
pub const REPLAY_WINDOW_MS: i64 = 20_000;

/// Size of the car profile block
pub const CAR_PROFILE_SIZE: usize = 304;

/// Dress-up sub-block inside the car profile (37 bytes)
pub const DRESS_UP_RANGE: Range<usize> = 185..222;

/// Maximum number of bytes in the process's short car name
pub const SHORT_NAME_SIZE: usize = 4;

/// Marker that prefixes every textual profile id
pub const PROFILE_ID_MARKER: &[u8; 4] = b"BG04";

/// Number of hex digits following the marker
pub const PROFILE_ID_HEX_DIGITS: usize = 12;

/// Total length of a textual profile id
pub const PROFILE_ID_TEXT_SIZE: usize = PROFILE_ID_MARKER.len() + PROFILE_ID_HEX_DIGITS;

/// Only the low 48 bits of a profile id are meaningful
pub const PROFILE_ID_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Name of the id file at the root of each removable volume
pub const PROFILE_ID_FILE_NAME: &str = "nesyskey.txt";

/// Number of drive letters a drive mask can address (A..Z)
pub const DRIVE_COUNT: u8 = 26;

/// Mask of the usable drive bits
pub const DRIVE_MASK_BITS: u32 = 0x03FF_FFFF;

/// How long a blackboard access may wait for its lock
pub const BLACKBOARD_LOCK_WAIT: Duration = Duration::from_millis(100);

/// Default profile server port
pub const DEFAULT_PORT: u16 = 8764;

/// Default profile server address
pub const DEFAULT_SERVER_ADDRESS: &str = "192.168.1.205";

/// Default executable name of the target process
pub const DEFAULT_EXE_NAME: &str = "game1.exe";

//! Profile identifiers and the `nesyskey.txt` id file
//!
//! An id is a 48-bit value written as the `BG04` marker followed by twelve
//! uppercase hex digits. The same 16-byte text is stored on removable
//! drives and returned by the server in `NewProfile` responses.

use crate::constants::{
    PROFILE_ID_FILE_NAME, PROFILE_ID_HEX_DIGITS, PROFILE_ID_MARKER, PROFILE_ID_MASK,
    PROFILE_ID_TEXT_SIZE,
};
use crate::error::{NesysError, io_err};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileId(u64);

impl ProfileId {
    /// Bits above the low 48 are discarded.
    pub fn new(value: u64) -> Self {
        Self(value & PROFILE_ID_MASK)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Always exactly 16 bytes: marker plus zero-padded uppercase hex.
    pub fn encode(&self) -> [u8; PROFILE_ID_TEXT_SIZE] {
        let mut out = [0u8; PROFILE_ID_TEXT_SIZE];
        out[..PROFILE_ID_MARKER.len()].copy_from_slice(PROFILE_ID_MARKER);
        let digits = format!("{:0width$X}", self.0, width = PROFILE_ID_HEX_DIGITS);
        out[PROFILE_ID_MARKER.len()..].copy_from_slice(digits.as_bytes());
        out
    }

    /// Parse the marker and twelve hex digits at the start of `text`. Any
    /// bytes after the sixteenth are ignored.
    pub fn decode(text: &[u8]) -> Result<Self, NesysError> {
        let invalid = || NesysError::InvalidIdFormat(String::from_utf8_lossy(text).into_owned());

        if text.len() < PROFILE_ID_TEXT_SIZE || !text.starts_with(PROFILE_ID_MARKER) {
            return Err(invalid());
        }
        let digits = &text[PROFILE_ID_MARKER.len()..PROFILE_ID_TEXT_SIZE];
        if !digits.iter().all(u8::is_ascii_hexdigit) {
            return Err(invalid());
        }
        let digits = std::str::from_utf8(digits).map_err(|_| invalid())?;
        let value = u64::from_str_radix(digits, 16).map_err(|_| invalid())?;
        Ok(Self(value))
    }

    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // encode() only ever produces ASCII
        f.write_str(&String::from_utf8_lossy(&self.encode()))
    }
}

impl FromStr for ProfileId {
    type Err = NesysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s.as_bytes())
    }
}

/// Location of the id file on a volume rooted at `root`.
pub fn id_file_path(root: &Path) -> PathBuf {
    root.join(PROFILE_ID_FILE_NAME)
}

/// Read the id file at `path`. Missing and malformed files are errors; the
/// caller decides whether that matters.
pub fn read_id_file(path: &Path) -> Result<ProfileId, NesysError> {
    let contents = fs::read(path).map_err(|e| io_err(path, e))?;
    let id = ProfileId::decode(&contents)?;
    debug!(path = %path.display(), %id, "read profile id file");
    Ok(id)
}

/// Write `id` to `path`, replacing any previous contents. No trailing newline.
pub fn write_id_file(path: &Path, id: ProfileId) -> Result<(), NesysError> {
    fs::write(path, id.encode()).map_err(|e| io_err(path, e))?;
    debug!(path = %path.display(), %id, "wrote profile id file");
    Ok(())
}

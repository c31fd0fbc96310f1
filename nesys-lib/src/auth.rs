//! Message authentication for the profile protocol
//!
//! Every request carries an HMAC-SHA-256 tag computed with the shared access
//! key over all bytes that precede the tag: the 6-byte header (with the
//! `has_hmac` bit already set), the body and the 8-byte timestamp.
//! Responses from the server are checked the same way before their
//! timestamp is used for replay protection.

use crate::constants::AUTH_TAG_SIZE;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute the 32-byte tag for `message` under `key`.
pub fn sign(key: &[u8], message: &[u8]) -> [u8; AUTH_TAG_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    let mut tag = [0u8; AUTH_TAG_SIZE];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    tag
}

/// Check `tag` against the tag computed for `message`. All 32 bytes are
/// compared before returning.
pub fn verify(key: &[u8], message: &[u8], tag: &[u8; AUTH_TAG_SIZE]) -> bool {
    let expected = sign(key, message);
    expected[..].ct_eq(&tag[..]).into()
}

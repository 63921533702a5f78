//! Content hashing for rapid-upload negotiation.

use base64::Engine as _;
use sha1::{Digest as _, Sha1};

/// Uppercase SHA-1 of the empty input.
pub const EMPTY_SHA1: &str = "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709";

/// Bytes covered by the pre-hash probe.
pub const PRE_HASH_LEN: usize = 1024;

/// Maximum bytes in a possession proof.
pub const PROOF_LEN: u64 = 8;

/// Lowercase hex SHA-1 of the first KiB of `head`.
pub fn pre_hash(head: &[u8]) -> String {
    let end = head.len().min(PRE_HASH_LEN);
    hex::encode(Sha1::digest(&head[..end]))
}

/// Uppercase hex SHA-1 of a complete buffer.
pub fn content_sha1(data: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(data))
}

/// Offset of the proof window: the first 16 hex chars of MD5(token), as a
/// u64, modulo the file size.
pub fn proof_offset(access_token: &str, size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    let digest = format!("{:x}", md5::compute(access_token.as_bytes()));
    let head = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
    head % size
}

/// Byte range `(offset, len)` the proof is read from.
pub fn proof_range(access_token: &str, size: u64) -> (u64, u64) {
    let offset = proof_offset(access_token, size);
    let len = PROOF_LEN.min(size - offset.min(size));
    (offset, len)
}

/// Base64 of the proof bytes.
pub fn proof_code(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Incremental full-content SHA-1.
#[derive(Default, Clone)]
pub struct ContentHasher {
    inner: Sha1,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Uppercase hex digest.
    pub fn finish(self) -> String {
        hex::encode_upper(self.inner.finalize())
    }
}

//! Key derivation for the content-addressed namespaces.
//!
//! Blob keys are the SHA-512 digest of an image's uncompressed bytes,
//! rendered as `sha512-<hex>`. Only half the digest is kept: full-length
//! paths are unwieldy, and 256 bits leaves no realistic chance of a
//! collision in a local store. Every key derivation funnels through the
//! same truncation so the keyspace never fragments.

use std::io::{self, Read};

use sha2::{Digest, Sha512};

/// Algorithm tag carried by every blob key.
pub const HASH_PREFIX: &str = "sha512-";
/// Raw digest size backing a key, in bytes.
const DIGEST_LEN: usize = 64;
/// Hex length of a key body: half the digest, rendered as hex.
pub const KEY_HEX_LEN: usize = DIGEST_LEN;
/// Total length of a full blob key.
pub const KEY_LEN: usize = HASH_PREFIX.len() + KEY_HEX_LEN;

/// Derive the blob key for a finalized SHA-512 digest.
///
/// Panics unless handed a full SHA-512 sum; callers always pass the output
/// of a [`Sha512`] hasher, so anything else is a programming error.
pub fn key_from_digest(digest: &[u8]) -> String {
    assert_eq!(
        digest.len(),
        DIGEST_LEN,
        "key digest must be a full sha512 sum"
    );
    let mut key = String::with_capacity(KEY_LEN);
    key.push_str(HASH_PREFIX);
    key.push_str(&hex::encode(digest)[..KEY_HEX_LEN]);
    key
}

/// Hash an arbitrary string down to the key-body length.
///
/// Keys `aciinfo` records by their blob key and derives the `appindex`
/// prefix for a logical image name.
pub fn short_sha512(s: &str) -> String {
    let digest = Sha512::digest(s.as_bytes());
    hex::encode(digest)[..KEY_HEX_LEN].to_string()
}

/// Reader adapter feeding every byte it yields into a running SHA-512.
pub struct HashingReader<R> {
    inner: R,
    digest: Sha512,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: Sha512::new(),
        }
    }

    /// Finish the digest and derive the blob key for everything read so far.
    pub fn into_key(self) -> String {
        key_from_digest(&self.digest.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

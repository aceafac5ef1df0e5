//! MD5 digests, base64 encoded, as returned by writes and checksum calls.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{StreamExt, TryStreamExt};
use md5::{Digest, Md5};
use std::sync::{Arc, Mutex, PoisonError};

use polystore_common::Result;

use crate::provider::ByteStream;

/// Digest a complete buffer.
pub fn digest(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

/// Incremental digest of bytes as they are transmitted.
#[derive(Default, Clone)]
pub struct Md5Digest {
    hasher: Md5,
}

impl Md5Digest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Base64 of the digest so far.
    pub fn finish(&self) -> String {
        STANDARD.encode(self.hasher.clone().finalize())
    }
}

/// Handle onto a digest fed by a [`tap`]ped stream.
#[derive(Clone)]
pub struct ChecksumTap {
    digest: Arc<Mutex<Md5Digest>>,
}

impl ChecksumTap {
    /// Digest of every chunk that has passed through the tap.
    pub fn finish(&self) -> String {
        self.digest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish()
    }
}

/// Wrap a stream in a digesting pass-through.
///
/// The returned stream yields the same chunks; the tap reports the digest of
/// the chunks consumed so far.
pub fn tap(stream: ByteStream) -> (ByteStream, ChecksumTap) {
    let digest = Arc::new(Mutex::new(Md5Digest::new()));
    let tap = ChecksumTap {
        digest: digest.clone(),
    };
    let stream = stream.inspect_ok(move |chunk| {
        digest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(chunk);
    });
    (Box::pin(stream), tap)
}

/// Drain a stream and digest it.
pub async fn digest_stream(mut stream: ByteStream) -> Result<String> {
    let mut digest = Md5Digest::new();
    while let Some(chunk) = stream.next().await {
        digest.update(&chunk?);
    }
    Ok(digest.finish())
}

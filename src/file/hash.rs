//! Single-pass content hashing for uploads.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// What a [`HashingReader`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashOutcome {
    /// Hex-encoded SHA-256 of every byte read.
    pub hash: String,
    /// Number of bytes read.
    pub bytes_read: u64,
    /// The complete content, if it fit within the capture limit.
    pub captured: Option<Vec<u8>>,
}

/// Reader adapter that digests and counts bytes as the backend drains it.
///
/// Up to `capture_limit` bytes are also kept so small text files can be
/// handed to the indexing hook without a second read.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
    capture_limit: usize,
    captured: Vec<u8>,
    overflowed: bool,
}

impl<R> HashingReader<R> {
    /// Wrap `inner`, capturing at most `capture_limit` bytes.
    pub fn new(inner: R, capture_limit: usize) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
            capture_limit,
            captured: Vec::new(),
            overflowed: capture_limit == 0,
        }
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Consume the adapter and return the digest.
    pub fn finish(self) -> HashOutcome {
        HashOutcome {
            hash: hex::encode(self.hasher.finalize()),
            bytes_read: self.bytes_read,
            captured: if self.overflowed {
                None
            } else {
                Some(self.captured)
            },
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_read += chunk.len() as u64;

        if self.overflowed {
            return;
        }
        if self.captured.len() + chunk.len() > self.capture_limit {
            self.overflowed = true;
            self.captured = Vec::new();
        } else {
            self.captured.extend_from_slice(chunk);
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let chunk = &buf.filled()[before..];
        this.observe(chunk);
        Poll::Ready(Ok(()))
    }
}

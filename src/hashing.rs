use std::io::{self, Read, Seek, SeekFrom};

use sha2::{Digest, Sha256};

/// Wraps a readable byte source and tees everything read from it through a
/// SHA-256 hasher.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns the digest of everything read so far as lowercase hex and
    /// restarts the hasher.
    pub fn finalize_hex(&mut self) -> String {
        let hasher = std::mem::replace(&mut self.hasher, Sha256::new());
        self.bytes_read = 0;
        hex::encode(hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.inner.read(buf)?;
        if size != 0 {
            self.hasher.update(&buf[..size]);
            self.bytes_read += size as u64;
        }
        Ok(size)
    }
}

impl<R: Read + Seek> HashingReader<R> {
    /// Drains the source to EOF, returning the digest and the number of bytes
    /// consumed, and leaves the source positioned back at the start so that it
    /// can be read again.
    pub fn digest_to_end(&mut self) -> io::Result<(String, u64)> {
        io::copy(&mut *self, &mut io::sink())?;

        let size = self.bytes_read();
        let digest = self.finalize_hex();

        self.inner.seek(SeekFrom::Start(0))?;
        Ok((digest, size))
    }
}

/// SHA-256 of the given bytes as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#![forbid(unsafe_code)]
//! CRC32 helpers for pages, WAL frames and overflow blobs.

/// Incremental checksum over a sequence of byte slices.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
#[derive(Clone)]
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a page body, bound to its position and the file salt so a
/// page copied to the wrong offset or from another index fails verification.
pub fn page_crc32(page_no: u64, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Checksum of a blob split across several chunks.
pub fn chunked_crc32<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_crc32_binds_position_and_salt() {
        let payload = vec![7u8; 64];
        let base = page_crc32(4, 99, &payload);
        assert_eq!(base, page_crc32(4, 99, &payload));
        assert_ne!(base, page_crc32(5, 99, &payload));
        assert_ne!(base, page_crc32(4, 100, &payload));

        let mut flipped = payload.clone();
        flipped[10] ^= 0x01;
        assert_ne!(base, page_crc32(4, 99, &flipped));
    }

    #[test]
    fn chunked_matches_contiguous() {
        let blob: Vec<u8> = (0..200u8).collect();
        let whole = chunked_crc32([blob.as_slice()]);
        let split = chunked_crc32(blob.chunks(33));
        assert_eq!(whole, split);
        assert_eq!(whole, crc32fast::hash(&blob));
    }
}

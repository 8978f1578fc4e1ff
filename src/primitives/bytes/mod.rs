#![forbid(unsafe_code)]
//! Varints and the byte writer/reader used by every on-disk codec.
//!
//! Decoding never panics: truncated or overlong input surfaces as
//! [`IndexError::Corruption`] so the caller can escalate to a rebuild.

use crate::types::{IndexError, Result};

pub mod var {
    //! Unsigned LEB128 varints.

    use crate::types::{IndexError, Result};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from `src`, advancing `off`.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(IndexError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(IndexError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(IndexError::Corruption("varint longer than 10 bytes"))
    }

    /// Number of bytes `encode_u64` would produce.
    pub fn encoded_len(mut v: u64) -> usize {
        let mut len = 1;
        while v >= 0x80 {
            v >>= 7;
            len += 1;
        }
        len
    }
}

/// Append-only encoder.
#[derive(Default, Debug)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Single byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Big-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Big-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Big-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Unsigned varint.
    pub fn put_var(&mut self, v: u64) {
        var::encode_u64(v, &mut self.buf);
    }

    /// One byte, 0 or 1.
    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_var(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer, returning its buffer.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked decoder over a byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    /// Reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    /// Offset of the next unread byte.
    pub fn position(&self) -> usize {
        self.off
    }

    /// Unread byte count.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.off)
    }

    /// True when every byte was consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Takes the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .off
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(IndexError::Corruption("record truncated"))?;
        let out = &self.buf[self.off..end];
        self.off = end;
        Ok(out)
    }

    /// Single byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Big-endian u16.
    pub fn get_u16(&mut self) -> Result<u16> {
        let mut out = [0u8; 2];
        out.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(out))
    }

    /// Big-endian u32.
    pub fn get_u32(&mut self) -> Result<u32> {
        let mut out = [0u8; 4];
        out.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(out))
    }

    /// Big-endian u64.
    pub fn get_u64(&mut self) -> Result<u64> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(out))
    }

    /// Unsigned varint.
    pub fn get_var(&mut self) -> Result<u64> {
        var::decode_u64(self.buf, &mut self.off)
    }

    /// Varint that must fit a `usize` length and the remaining input.
    pub fn get_len(&mut self) -> Result<usize> {
        let len = self.get_var()?;
        if len > self.remaining() as u64 {
            return Err(IndexError::Corruption("length prefix exceeds record"));
        }
        Ok(len as usize)
    }

    /// Boolean byte; anything but 0 or 1 is corruption.
    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(IndexError::Corruption("invalid boolean byte")),
        }
    }

    /// Length-prefixed byte string.
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_len()?;
        self.take(len)
    }

    /// Length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> Result<&'a str> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| IndexError::Corruption("string is not UTF-8"))
    }

    /// Fails unless every byte was consumed.
    pub fn finish(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(IndexError::Corruption("trailing bytes after record"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            var::encode_u64(v, &mut out);
            assert_eq!(out.len(), var::encoded_len(v));
            let mut off = 0;
            assert_eq!(var::decode_u64(&out, &mut off).unwrap(), v);
            assert_eq!(off, out.len());
        }
    }

    #[test]
    fn varint_truncation_is_corruption() {
        let mut off = 0;
        assert!(matches!(
            var::decode_u64(&[0x80, 0x80], &mut off),
            Err(IndexError::Corruption(_))
        ));
        let mut off = 0;
        assert!(var::decode_u64(&[0xFF; 11], &mut off).is_err());
    }

    #[test]
    fn writer_reader_mixed_fields() {
        let mut w = ByteWriter::new();
        w.put_u8(b'T');
        w.put_u16(513);
        w.put_u32(70_000);
        w.put_u64(1 << 40);
        w.put_var(300);
        w.put_bool(true);
        w.put_str("package:a/b.dart");
        let bytes = w.into_inner();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), b'T');
        assert_eq!(r.get_u16().unwrap(), 513);
        assert_eq!(r.get_u32().unwrap(), 70_000);
        assert_eq!(r.get_u64().unwrap(), 1 << 40);
        assert_eq!(r.get_var().unwrap(), 300);
        assert!(r.get_bool().unwrap());
        assert_eq!(r.get_str().unwrap(), "package:a/b.dart");
        r.finish().unwrap();
    }

    #[test]
    fn reader_rejects_lying_length_prefix() {
        let mut w = ByteWriter::new();
        w.put_var(50);
        w.put_u8(1);
        let bytes = w.into_inner();
        let mut r = ByteReader::new(&bytes);
        assert!(matches!(r.get_bytes(), Err(IndexError::Corruption(_))));
    }

    #[test]
    fn finish_rejects_trailing_bytes() {
        let r = ByteReader::new(&[1, 2]);
        assert!(r.finish().is_err());
    }
}

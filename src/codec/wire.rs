//! Low-level wire primitives for the frame format.
//!
//! All integers are big-endian. Strings are a u32 length followed by UTF-8
//! bytes; byte payloads are a u32 length followed by raw octets; string
//! sequences are a u32 count followed by that many strings. Optional fields
//! carry a single presence byte (0 = absent, 1 = present) before the body.

use super::{CodecError, MalformedFrame};

/// Maximum length of any single field (64 MB). Safety valve against
/// malformed length prefixes.
pub const MAX_FIELD_SIZE: u32 = 64 * 1024 * 1024;

/// Sequential writer over a growable byte buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Length prefix, capped on the write side too: a field the decoder
    /// would reject must not be encodable in the first place.
    fn put_len(&mut self, len: usize) -> Result<(), CodecError> {
        let len = u32::try_from(len)
            .ok()
            .filter(|&len| len <= MAX_FIELD_SIZE)
            .ok_or(CodecError::Malformed(MalformedFrame::Oversize(
                u32::try_from(len).unwrap_or(u32::MAX),
            )))?;
        self.put_u32(len);
        Ok(())
    }

    pub fn put_str(&mut self, s: &str) -> Result<(), CodecError> {
        self.put_len(s.len())?;
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> Result<(), CodecError> {
        self.put_len(b.len())?;
        self.buf.extend_from_slice(b);
        Ok(())
    }

    /// Optional string. `None` writes a single absent byte.
    pub fn put_opt_str(&mut self, s: Option<&str>) -> Result<(), CodecError> {
        match s {
            Some(s) => {
                self.put_u8(1);
                self.put_str(s)?;
            }
            None => self.put_u8(0),
        }
        Ok(())
    }

    /// Optional string sequence. An **empty** sequence is written as absent;
    /// this asymmetry (empty encodes as nil) is part of the wire contract.
    pub fn put_opt_str_seq(&mut self, seq: Option<&[String]>) -> Result<(), CodecError> {
        match seq {
            Some(items) if !items.is_empty() => {
                self.put_u8(1);
                self.put_len(items.len())?;
                for item in items {
                    self.put_str(item)?;
                }
            }
            _ => self.put_u8(0),
        }
        Ok(())
    }
}

/// Sequential reader over a byte slice.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether the reader has consumed the whole input.
    pub const fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(CodecError::Malformed(MalformedFrame::Truncated))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        let raw = self.take(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(raw);
        Ok(i64::from_be_bytes(b))
    }

    fn get_len(&mut self) -> Result<usize, CodecError> {
        let len = self.get_u32()?;
        if len > MAX_FIELD_SIZE {
            return Err(CodecError::Malformed(MalformedFrame::Oversize(len)));
        }
        Ok(len as usize)
    }

    pub fn get_str(&mut self) -> Result<String, CodecError> {
        let len = self.get_len()?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CodecError::Malformed(MalformedFrame::InvalidUtf8))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.get_len()?;
        Ok(self.take(len)?.to_vec())
    }

    fn get_presence(&mut self) -> Result<bool, CodecError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Malformed(MalformedFrame::BadPresenceByte(other))),
        }
    }

    pub fn get_opt_str(&mut self) -> Result<Option<String>, CodecError> {
        if self.get_presence()? {
            Ok(Some(self.get_str()?))
        } else {
            Ok(None)
        }
    }

    pub fn get_opt_str_seq(&mut self) -> Result<Option<Vec<String>>, CodecError> {
        if !self.get_presence()? {
            return Ok(None);
        }
        let count = self.get_len()?;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(self.get_str()?);
        }
        Ok(Some(items))
    }

    /// Read an optional sub-record: presence byte, then `parse` if present.
    pub fn get_opt_record<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Option<T>, CodecError> {
        if self.get_presence()? {
            Ok(Some(parse(self)?))
        } else {
            Ok(None)
        }
    }
}

//! Byte-oriented reader/writer with SSH typed primitives (RFC 4251 Section 5).
//!
//! Every SSH message codec, the exchange-hash computation and the SFTP
//! engine read and write through this buffer instead of hand-rolling
//! offsets. Supported primitives:
//!
//! - `byte`, `boolean`, `uint32`, `uint64`
//! - `string` (uint32 length + bytes)
//! - `mpint` (two's-complement, minimal encoding)
//! - `name-list` (comma-separated ASCII inside a string)
//!
//! All integers are big-endian on the wire.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::buffer::Buffer;
//!
//! let mut buf = Buffer::new();
//! buf.put_u32(42);
//! buf.put_str("ssh-userauth");
//!
//! let mut reader = Buffer::from(buf.into_bytes());
//! assert_eq!(reader.get_u32().unwrap(), 42);
//! assert_eq!(reader.get_string_utf8().unwrap(), "ssh-userauth");
//! ```

use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};

/// Growable byte buffer with a read cursor.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: BytesMut,
    rpos: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            rpos: 0,
        }
    }

    /// Creates an empty buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            rpos: 0,
        }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.rpos
    }

    /// Returns the unread bytes without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.rpos..]
    }

    /// Returns the whole written content, ignoring the read cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the buffer, returning its content.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data.to_vec()
    }

    fn need(&self, n: usize, what: &str) -> KeelResult<()> {
        if self.remaining() < n {
            return Err(KeelError::Protocol(format!(
                "Truncated {}: need {} bytes, {} available",
                what,
                n,
                self.remaining()
            )));
        }
        Ok(())
    }

    // --- writers ---

    /// Writes a single byte.
    pub fn put_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Writes a boolean as a single byte (0 or 1).
    pub fn put_bool(&mut self, value: bool) {
        self.data.put_u8(u8::from(value));
    }

    /// Writes a big-endian uint16.
    pub fn put_u16(&mut self, value: u16) {
        self.data.put_u16(value);
    }

    /// Writes a big-endian uint32.
    pub fn put_u32(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    /// Writes a big-endian uint64.
    pub fn put_u64(&mut self, value: u64) {
        self.data.put_u64(value);
    }

    /// Writes raw bytes with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Writes a length-prefixed byte string.
    pub fn put_string(&mut self, bytes: &[u8]) {
        self.data.put_u32(bytes.len() as u32);
        self.data.put_slice(bytes);
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        self.put_string(s.as_bytes());
    }

    /// Writes an mpint: leading zeros trimmed, a 0x00 pad prepended when
    /// the high bit is set, zero encoded as the empty string.
    pub fn put_mpint(&mut self, magnitude: &[u8]) {
        let trimmed: &[u8] = {
            let mut start = 0;
            while start < magnitude.len() && magnitude[start] == 0 {
                start += 1;
            }
            &magnitude[start..]
        };

        if trimmed.is_empty() {
            self.data.put_u32(0);
            return;
        }

        if trimmed[0] & 0x80 != 0 {
            self.data.put_u32(trimmed.len() as u32 + 1);
            self.data.put_u8(0);
        } else {
            self.data.put_u32(trimmed.len() as u32);
        }
        self.data.put_slice(trimmed);
    }

    /// Writes a name-list: comma-separated names inside a string.
    pub fn put_name_list(&mut self, names: &[String]) {
        self.put_str(&names.join(","));
    }

    // --- readers ---

    /// Reads a single byte.
    pub fn get_u8(&mut self) -> KeelResult<u8> {
        self.need(1, "byte")?;
        let value = self.data[self.rpos];
        self.rpos += 1;
        Ok(value)
    }

    /// Reads a boolean (any non-zero byte is true).
    pub fn get_bool(&mut self) -> KeelResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a big-endian uint16.
    pub fn get_u16(&mut self) -> KeelResult<u16> {
        self.need(2, "uint16")?;
        let b = &self.data[self.rpos..self.rpos + 2];
        self.rpos += 2;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian uint32.
    pub fn get_u32(&mut self) -> KeelResult<u32> {
        self.need(4, "uint32")?;
        let b = &self.data[self.rpos..self.rpos + 4];
        self.rpos += 4;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian uint64.
    pub fn get_u64(&mut self) -> KeelResult<u64> {
        self.need(8, "uint64")?;
        let b = &self.data[self.rpos..self.rpos + 8];
        self.rpos += 8;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads `n` raw bytes.
    pub fn get_raw(&mut self, n: usize) -> KeelResult<Vec<u8>> {
        self.need(n, "raw bytes")?;
        let bytes = self.data[self.rpos..self.rpos + n].to_vec();
        self.rpos += n;
        Ok(bytes)
    }

    /// Reads a length-prefixed byte string.
    pub fn get_string(&mut self) -> KeelResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        self.need(len, "string body")?;
        let bytes = self.data[self.rpos..self.rpos + len].to_vec();
        self.rpos += len;
        Ok(bytes)
    }

    /// Reads a length-prefixed string and validates UTF-8.
    pub fn get_string_utf8(&mut self) -> KeelResult<String> {
        let bytes = self.get_string()?;
        String::from_utf8(bytes)
            .map_err(|_| KeelError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads an mpint, returning the magnitude with any sign pad stripped.
    pub fn get_mpint(&mut self) -> KeelResult<Vec<u8>> {
        let mut bytes = self.get_string()?;
        if bytes.first().is_some_and(|b| b & 0x80 != 0) {
            return Err(KeelError::Protocol(
                "Negative mpint not supported".to_string(),
            ));
        }
        if bytes.first() == Some(&0) {
            bytes.remove(0);
        }
        Ok(bytes)
    }

    /// Reads a name-list into its component names.
    pub fn get_name_list(&mut self) -> KeelResult<Vec<String>> {
        let joined = self.get_string_utf8()?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        if !joined.is_ascii() {
            return Err(KeelError::Protocol(
                "Name-list contains non-ASCII characters".to_string(),
            ));
        }
        Ok(joined.split(',').map(String::from).collect())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&data[..]),
            rpos: 0,
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
            rpos: 0,
        }
    }
}

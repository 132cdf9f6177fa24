//! SSH wire data types (RFC 4251 Section 5).
//!
//! Writers append to a [`BytesMut`]; [`Reader`] walks a borrowed payload and
//! fails with a protocol violation on truncation.
//!
//! ```text
//! byte, boolean, uint32, uint64, string, mpint, name-list
//! ```

use bytes::{BufMut, BytesMut};
use tether_platform::{TetherError, TetherResult};

/// Writes a length-prefixed byte string.
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes a UTF-8 string.
pub fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Writes a boolean.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a comma-separated name-list.
pub fn put_name_list<S: AsRef<str>>(buf: &mut BytesMut, names: &[S]) {
    let joined = names
        .iter()
        .map(|n| n.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    put_str(buf, &joined);
}

/// Writes an unsigned big-endian integer as an mpint.
///
/// Leading zeros are stripped and a zero byte is prepended when the high
/// bit is set, so the value stays positive.
pub fn put_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        buf.put_u32(0);
        return;
    }

    if trimmed[0] & 0x80 != 0 {
        buf.put_u32(trimmed.len() as u32 + 1);
        buf.put_u8(0);
    } else {
        buf.put_u32(trimmed.len() as u32);
    }
    buf.put_slice(trimmed);
}

/// Cursor over an SSH payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.offset
    }

    fn take(&mut self, len: usize, what: &str) -> TetherResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(TetherError::protocol(format!(
                "truncated {} at offset {}: need {} bytes, have {}",
                what,
                self.offset,
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> TetherResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a boolean (any non-zero byte is true).
    pub fn read_bool(&mut self) -> TetherResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn read_u32(&mut self) -> TetherResult<u32> {
        let b = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a fixed number of raw bytes.
    pub fn read_raw(&mut self, len: usize) -> TetherResult<&'a [u8]> {
        self.take(len, "raw bytes")
    }

    /// Reads a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> TetherResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, "string")
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> TetherResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| TetherError::protocol("string contains invalid UTF-8"))
    }

    /// Reads a name-list. An empty string yields an empty list.
    pub fn read_name_list(&mut self) -> TetherResult<Vec<String>> {
        let joined = self.read_string()?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        Ok(joined.split(',').map(String::from).collect())
    }

    /// Reads an mpint and returns its magnitude without the sign byte.
    pub fn read_mpint(&mut self) -> TetherResult<&'a [u8]> {
        let bytes = self.read_bytes()?;
        if bytes.first().map_or(false, |b| b & 0x80 != 0) {
            return Err(TetherError::protocol("negative mpint"));
        }
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        Ok(&bytes[start..])
    }

    /// Returns everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }

    /// Consumes the message-number byte and checks it.
    pub fn expect_message(&mut self, number: u8, name: &str) -> TetherResult<()> {
        let got = self.read_u8()?;
        if got != number {
            return Err(TetherError::protocol(format!(
                "invalid message type: expected {} ({}), got {}",
                number, name, got
            )));
        }
        Ok(())
    }
}

//! Bounds-checked little-endian reader over a blob

use thiserror::Error;

/// Errors raised while decoding blob structures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A read ran past the end of the buffer
    #[error("unexpected end of data at offset {offset} (need {needed} bytes)")]
    UnexpectedEof {
        /// Offset at which the read started
        offset: usize,
        /// Number of bytes the read needed
        needed: usize,
    },

    /// A negative or otherwise unusable offset was followed
    #[error("invalid offset {0}")]
    InvalidOffset(i64),

    /// A string was not valid UTF-8
    #[error("invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// A boolean byte held something other than 0 or 1
    #[error("invalid boolean value {value} at offset {offset}")]
    InvalidBool {
        /// Offending byte
        value: u8,
        /// Offset of the byte
        offset: usize,
    },
}

/// Cursor over an immutable byte slice.
///
/// Every read checks bounds and advances the cursor; nothing is read
/// through raw pointers.
#[derive(Debug, Clone)]
pub struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    /// Create a reader positioned at the start of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Create a reader positioned at `offset`
    pub fn at(data: &'a [u8], offset: usize) -> Result<Self, DecodeError> {
        if offset > data.len() {
            return Err(DecodeError::UnexpectedEof { offset, needed: 0 });
        }
        Ok(Self { data, pos: offset })
    }

    /// Create a reader positioned at a signed offset, rejecting negatives
    pub fn at_signed(data: &'a [u8], offset: i32) -> Result<Self, DecodeError> {
        let offset = usize::try_from(offset).map_err(|_| DecodeError::InvalidOffset(offset as i64))?;
        Self::at(data, offset)
    }

    /// Current position
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Read `len` raw bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(DecodeError::UnexpectedEof { offset: self.pos, needed: len })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Read a fixed-size byte array
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a little-endian `u16`
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `u32`
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `i32`
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian `u64`
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a strict boolean byte (0 or 1)
    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        let offset = self.pos;
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidBool { value, offset }),
        }
    }

    /// Read a `u16`-length-prefixed UTF-8 string
    pub fn read_name(&mut self) -> Result<&'a str, DecodeError> {
        let len = self.read_u16()? as usize;
        let offset = self.pos;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(offset))
    }

    /// Read a NUL-terminated UTF-8 string
    pub fn read_c_str(&mut self) -> Result<&'a str, DecodeError> {
        let offset = self.pos;
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnexpectedEof { offset, needed: rest.len() + 1 })?;
        let s = std::str::from_utf8(&rest[..len]).map_err(|_| DecodeError::InvalidUtf8(offset))?;
        self.pos += len + 1;
        Ok(s)
    }

    /// Read a `count`-prefixed list of `i32` values
    pub fn read_i32_list(&mut self) -> Result<Vec<i32>, DecodeError> {
        let count = self.read_count()?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_i32()?);
        }
        Ok(values)
    }

    /// Read a `count`-prefixed list of `u32` values
    pub fn read_u32_list(&mut self) -> Result<Vec<u32>, DecodeError> {
        let count = self.read_count()?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_u32()?);
        }
        Ok(values)
    }

    /// Read an element count and make sure that many 4-byte items can follow
    fn read_count(&mut self) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let count = self.read_i32()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::InvalidOffset(count as i64))?;
        let needed = count.saturating_mul(4);
        if needed > self.remaining() {
            return Err(DecodeError::UnexpectedEof { offset, needed });
        }
        Ok(count)
    }
}

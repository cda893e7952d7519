//! Little-endian byte sink used to produce blobs

/// Growable little-endian byte buffer with back-patching.
#[derive(Debug, Default)]
pub struct BlobWriter {
    /// Bytes written so far
    pub buffer: Vec<u8>,
}

impl BlobWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Number of bytes written
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Emit a single byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a little-endian `u16`
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a little-endian `u32`
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a little-endian `i32`
    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a little-endian `u64`
    pub fn emit_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a `u16`-length-prefixed string (truncated to `u16::MAX` bytes)
    pub fn emit_name(&mut self, name: &str) {
        let bytes = &name.as_bytes()[..name.len().min(u16::MAX as usize)];
        self.emit_u16(bytes.len() as u16);
        self.emit_bytes(bytes);
    }

    /// Pad with `fill` until the length is a multiple of `alignment`
    pub fn align_to(&mut self, alignment: usize, fill: u8) {
        let rem = self.buffer.len() % alignment;
        if rem != 0 {
            self.buffer.resize(self.buffer.len() + alignment - rem, fill);
        }
    }

    /// Overwrite a previously emitted `u32`
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Take the written bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

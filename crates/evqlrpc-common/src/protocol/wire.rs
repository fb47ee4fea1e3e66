//! Primitive payload encodings shared by the control frames.
//!
//! Integers inside payloads are LEB128 variable-length unsigned integers;
//! strings are length-encoded (varuint length followed by the raw bytes).

use bytes::{BufMut, BytesMut};

use super::error::{EvqlError, Result};

/// Appends `value` as a LEB128 varuint.
pub fn put_varuint(dst: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Appends a length-encoded byte string.
pub fn put_lenenc(dst: &mut BytesMut, data: &[u8]) {
    put_varuint(dst, data.len() as u64);
    dst.put_slice(data);
}

/// Cursor over a frame payload.
pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| EvqlError::Protocol("unexpected end of payload".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_varuint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(EvqlError::Protocol("varuint overflow".to_string()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(EvqlError::Protocol(format!(
                "payload truncated: need {} bytes, have {}",
                len,
                self.remaining()
            )));
        }
        let data = self.data;
        let slice = &data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_lenenc(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varuint()?;
        let len = usize::try_from(len)
            .map_err(|_| EvqlError::Protocol("string length overflow".to_string()))?;
        self.read_bytes(len)
    }

    pub fn read_lenenc_string(&mut self) -> Result<String> {
        let bytes = self.read_lenenc()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EvqlError::Protocol(format!("invalid utf-8 string: {}", e)))
    }
}

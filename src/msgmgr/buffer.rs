//! Pooled wire buffer with paired insertion/extraction cursors

use crate::config::MAX_MESSAGE_LENGTH;
use crate::error::{Error, Result};
use crate::opm::Poolable;

/// Byte buffer every transport serializes through.
///
/// Inserters append at the tail; extractors consume from a separate cursor,
/// so one buffer can be filled and drained without copying. Primitive
/// codecs use network byte order when the buffer was built with the
/// network-order init param (nonzero), host order otherwise. Total content
/// is bounded by [`MAX_MESSAGE_LENGTH`].
pub struct MessageBuffer {
    data: Vec<u8>,
    extract_index: usize,
    network_order: bool,
}

impl MessageBuffer {
    pub fn new(network_order: bool) -> Self {
        Self {
            data: Vec::with_capacity(MAX_MESSAGE_LENGTH),
            extract_index: 0,
            network_order,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes not yet consumed by the extraction cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.extract_index
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.extract_index = 0;
    }

    /// Reset the extraction cursor to the start without touching content.
    pub fn rewind(&mut self) {
        self.extract_index = 0;
    }

    /// Cut the content down to `len` bytes; used after reading a datagram
    /// into a maximum-sized frame.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.extract_index = self.extract_index.min(len);
    }

    /// Hex dump of the full content, for per-mailbox debug tracing.
    pub fn hex_dump(&self) -> String {
        hex::encode(&self.data)
    }

    fn check_room(&self, needed: usize) -> Result<()> {
        let available = MAX_MESSAGE_LENGTH - self.data.len();
        if needed > available {
            return Err(Error::BufferOverflow { needed, available });
        }
        Ok(())
    }

    fn check_remaining(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(Error::BufferUnderflow { needed, remaining });
        }
        Ok(())
    }

    /// Replace the content with `len` writable zero bytes, for transports
    /// that read a frame straight off the wire.
    pub fn make_room(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > MAX_MESSAGE_LENGTH {
            return Err(Error::BufferOverflow { needed: len, available: MAX_MESSAGE_LENGTH });
        }
        self.data.clear();
        self.data.resize(len, 0);
        self.extract_index = 0;
        Ok(&mut self.data[..])
    }

    pub fn insert_u8(&mut self, value: u8) -> Result<()> {
        self.check_room(1)?;
        self.data.push(value);
        Ok(())
    }

    pub fn insert_u16(&mut self, value: u16) -> Result<()> {
        self.check_room(2)?;
        let bytes = if self.network_order { value.to_be_bytes() } else { value.to_ne_bytes() };
        self.data.extend_from_slice(&bytes);
        Ok(())
    }

    pub fn insert_u32(&mut self, value: u32) -> Result<()> {
        self.check_room(4)?;
        let bytes = if self.network_order { value.to_be_bytes() } else { value.to_ne_bytes() };
        self.data.extend_from_slice(&bytes);
        Ok(())
    }

    pub fn insert_u64(&mut self, value: u64) -> Result<()> {
        self.check_room(8)?;
        let bytes = if self.network_order { value.to_be_bytes() } else { value.to_ne_bytes() };
        self.data.extend_from_slice(&bytes);
        Ok(())
    }

    pub fn insert_i32(&mut self, value: i32) -> Result<()> {
        self.insert_u32(value as u32)
    }

    /// Length-prefixed (u16) UTF-8 string.
    pub fn insert_str(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(Error::BufferOverflow {
                needed: bytes.len(),
                available: u16::MAX as usize,
            });
        }
        self.check_room(2 + bytes.len())?;
        self.insert_u16(bytes.len() as u16)?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Raw bytes, no length prefix.
    pub fn insert_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_room(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn extract_u8(&mut self) -> Result<u8> {
        self.check_remaining(1)?;
        let value = self.data[self.extract_index];
        self.extract_index += 1;
        Ok(value)
    }

    pub fn extract_u16(&mut self) -> Result<u16> {
        self.check_remaining(2)?;
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.data[self.extract_index..self.extract_index + 2]);
        self.extract_index += 2;
        Ok(if self.network_order { u16::from_be_bytes(bytes) } else { u16::from_ne_bytes(bytes) })
    }

    pub fn extract_u32(&mut self) -> Result<u32> {
        self.check_remaining(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[self.extract_index..self.extract_index + 4]);
        self.extract_index += 4;
        Ok(if self.network_order { u32::from_be_bytes(bytes) } else { u32::from_ne_bytes(bytes) })
    }

    pub fn extract_u64(&mut self) -> Result<u64> {
        self.check_remaining(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[self.extract_index..self.extract_index + 8]);
        self.extract_index += 8;
        Ok(if self.network_order { u64::from_be_bytes(bytes) } else { u64::from_ne_bytes(bytes) })
    }

    pub fn extract_i32(&mut self) -> Result<i32> {
        Ok(self.extract_u32()? as i32)
    }

    pub fn extract_str(&mut self) -> Result<String> {
        let len = self.extract_u16()? as usize;
        let bytes = self.extract_raw(len)?;
        String::from_utf8(bytes).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn extract_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        self.check_remaining(len)?;
        let bytes = self.data[self.extract_index..self.extract_index + len].to_vec();
        self.extract_index += len;
        Ok(bytes)
    }
}

impl Poolable for MessageBuffer {
    fn new_instance(init_param: i64) -> Self {
        MessageBuffer::new(init_param != 0)
    }

    fn clean(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip_in_network_order() {
        let mut buf = MessageBuffer::new(true);
        buf.insert_u8(0xAB).unwrap();
        buf.insert_u16(0x1234).unwrap();
        buf.insert_u32(0xDEADBEEF).unwrap();
        buf.insert_u64(42).unwrap();
        buf.insert_str("hello").unwrap();

        // Network order is observable on the raw bytes
        assert_eq!(&buf.as_slice()[1..3], &[0x12, 0x34]);

        assert_eq!(buf.extract_u8().unwrap(), 0xAB);
        assert_eq!(buf.extract_u16().unwrap(), 0x1234);
        assert_eq!(buf.extract_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(buf.extract_u64().unwrap(), 42);
        assert_eq!(buf.extract_str().unwrap(), "hello");
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn host_order_primitives_round_trip() {
        let mut buf = MessageBuffer::new(false);
        buf.insert_u32(0x01020304).unwrap();
        buf.insert_i32(-7).unwrap();
        assert_eq!(buf.extract_u32().unwrap(), 0x01020304);
        assert_eq!(buf.extract_i32().unwrap(), -7);
    }

    #[test]
    fn rewind_replays_the_content() {
        let mut buf = MessageBuffer::new(true);
        buf.insert_u16(0xBEEF).unwrap();
        assert_eq!(buf.extract_u16().unwrap(), 0xBEEF);
        buf.rewind();
        assert_eq!(buf.extract_u16().unwrap(), 0xBEEF);
    }

    #[test]
    fn underflow_is_an_error() {
        let mut buf = MessageBuffer::new(true);
        buf.insert_u8(1).unwrap();
        buf.extract_u8().unwrap();
        assert!(matches!(
            buf.extract_u32(),
            Err(Error::BufferUnderflow { needed: 4, remaining: 0 })
        ));
    }

    #[test]
    fn overflow_is_an_error() {
        let mut buf = MessageBuffer::new(true);
        let big = vec![0u8; MAX_MESSAGE_LENGTH];
        buf.insert_raw(&big).unwrap();
        assert!(matches!(buf.insert_u8(0), Err(Error::BufferOverflow { .. })));
    }

    #[test]
    fn make_room_bounds_frame_size() {
        let mut buf = MessageBuffer::new(true);
        assert!(buf.make_room(MAX_MESSAGE_LENGTH).is_ok());
        assert!(buf.make_room(MAX_MESSAGE_LENGTH + 1).is_err());
    }

    #[test]
    fn clean_resets_both_cursors() {
        let mut buf = MessageBuffer::new(true);
        buf.insert_u32(7).unwrap();
        buf.extract_u16().unwrap();
        buf.clean();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.remaining(), 0);
    }
}

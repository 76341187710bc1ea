//! Little-endian wire primitives: alignment, an append writer with array
//! length backfill, and a bounds-checked read cursor.

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::error::{Error, Result};

/// Rounds `ix` up to the next multiple of `alignment` (a power of two).
pub const fn align_up(ix: usize, alignment: usize) -> usize {
    (ix + alignment - 1) & !(alignment - 1)
}

/// The marshaling alignment of a type by its leading signature token.
pub fn alignment_of(token: char) -> Result<usize> {
    match token {
        'y' | 'g' | 'v' => Ok(1),
        'n' | 'q' => Ok(2),
        'b' | 'i' | 'u' | 's' | 'o' | 'h' | 'a' => Ok(4),
        'x' | 't' | 'd' | '(' | '{' => Ok(8),
        _ => Err(Error::Signature(format!("unknown token '{}'", token))),
    }
}

/// Marks a reserved array-length slot in a [`WireWriter`]. The recorded
/// content offset points past the element-alignment padding, which the wire
/// format excludes from the length.
#[derive(Debug, Clone, Copy)]
pub struct LengthToken {
    fill_ix: usize,
    content_ix: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> WireWriter {
        WireWriter { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Zero-pads up to the given power-of-two alignment.
    pub fn align(&mut self, alignment: usize) {
        let new_len = align_up(self.buf.len(), alignment);
        self.buf.resize(new_len, 0);
    }

    fn grow(&mut self, size: usize) -> &mut [u8] {
        let old_len = self.buf.len();
        self.buf.resize(old_len + size, 0);
        &mut self.buf[old_len..]
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.align(2);
        LittleEndian::write_u16(self.grow(2), v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.put_u16(v as u16);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.align(4);
        LittleEndian::write_u32(self.grow(4), v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.align(8);
        LittleEndian::write_u64(self.grow(8), v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.align(8);
        LittleEndian::write_f64(self.grow(8), v);
    }

    /// A string: aligned u32 byte length, bytes, NUL terminator.
    pub fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// A signature string: u8 byte length, bytes, NUL terminator.
    pub fn put_signature(&mut self, s: &str) {
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Reserves an array length slot: aligns to 4, writes a placeholder u32,
    /// then pads to the element alignment. The length later backfilled by
    /// [`WireWriter::end_length`] covers only the bytes after that padding.
    pub fn begin_length(&mut self, elem_alignment: usize) -> LengthToken {
        self.align(4);
        let fill_ix = self.buf.len();
        self.grow(4);
        self.align(elem_alignment);
        LengthToken {
            fill_ix,
            content_ix: self.buf.len(),
        }
    }

    pub fn end_length(&mut self, token: LengthToken) -> Result<()> {
        let length = self.buf.len() - token.content_ix;
        // D-Bus caps a single array at 2^26 bytes.
        if length > 1 << 26 {
            return Err(Error::Overflow {
                token: 'a',
                value: length as i128,
            });
        }
        LittleEndian::write_u32(
            &mut self.buf[token.fill_ix..token.fill_ix + 4],
            length as u32,
        );
        Ok(())
    }
}

/// Read cursor over one message's bytes. Every read validates the end index
/// so truncated input surfaces as an error, never a panic.
#[derive(Debug)]
pub struct WireCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    pub fn new(data: &'a [u8]) -> WireCursor<'a> {
        WireCursor { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> WireCursor<'a> {
        WireCursor { data, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn check(&self) -> Result<()> {
        if self.pos > self.data.len() {
            return Err(Error::Truncated(self.pos));
        }
        Ok(())
    }

    pub fn align(&mut self, alignment: usize) -> Result<()> {
        self.pos = align_up(self.pos, alignment);
        self.check()
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let start = self.pos;
        self.pos += len;
        self.check()?;
        Ok(&self.data[start..self.pos])
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        self.align(8)?;
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    pub fn get_str(&mut self) -> Result<&'a str> {
        let len = self.get_u32()? as usize;
        trace!("read string of {} bytes at {}", len, self.pos);
        let bytes = self.take(len + 1)?;
        std::str::from_utf8(&bytes[..len]).map_err(|_| Error::Frame("string is not UTF-8"))
    }

    pub fn get_signature_str(&mut self) -> Result<&'a str> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len + 1)?;
        std::str::from_utf8(&bytes[..len]).map_err(|_| Error::Frame("signature is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(3, 1), 3);
    }

    #[test]
    fn writer_pads_before_wide_values() {
        let mut w = WireWriter::new();
        w.put_u8(1);
        w.put_u32(2);
        assert_eq!(w.as_bytes(), &[1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn string_layout() {
        let mut w = WireWriter::new();
        w.put_str("hi");
        assert_eq!(w.as_bytes(), &[2, 0, 0, 0, b'h', b'i', 0]);

        let mut w = WireWriter::new();
        w.put_signature("a{sv}");
        assert_eq!(w.as_bytes(), &[5, b'a', b'{', b's', b'v', b'}', 0]);
    }

    #[test]
    fn array_length_excludes_element_padding() {
        // array of u64: 4 pad bytes between the length and the first element
        // must not count toward the length
        let mut w = WireWriter::new();
        let token = w.begin_length(8);
        w.put_u64(7);
        w.end_length(token).unwrap();
        assert_eq!(
            w.as_bytes(),
            &[8, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn cursor_reads_back_writer_output() {
        let mut w = WireWriter::new();
        w.put_u8(9);
        w.put_i16(-2);
        w.put_str("abc");
        w.put_f64(1.5);

        let mut c = WireCursor::new(w.as_bytes());
        assert_eq!(c.get_u8().unwrap(), 9);
        assert_eq!(c.get_i16().unwrap(), -2);
        assert_eq!(c.get_str().unwrap(), "abc");
        assert_eq!(c.get_f64().unwrap(), 1.5);
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn cursor_rejects_truncated_reads() {
        let mut c = WireCursor::new(&[1, 2]);
        assert!(matches!(c.get_u32(), Err(Error::Truncated(_))));
    }
}

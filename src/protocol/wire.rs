//! Little-endian and length-encoded wire primitives.
//!
//! Decoding goes through [`Reader`], a cursor over one logical packet that checks the remaining
//! length before every read and reports the failing offset. Encoding is provided for every
//! [`BufMut`] through the [`WireWrite`] extension trait.

use bytes::BufMut;

use crate::error::{Error, Result};

/// Marker for a NULL column value in text rows.
pub const NULL_MARKER: u8 = 0xFB;

const LENENC_2: u8 = 0xFC;
const LENENC_3: u8 = 0xFD;
const LENENC_8: u8 = 0xFE;

/// Bytes needed to length-encode `value`.
pub fn lenenc_len(value: u64) -> usize {
    if value < 251 {
        1
    } else if value < 1 << 16 {
        3
    } else if value < 1 << 24 {
        4
    } else {
        9
    }
}

/// Bounds-checked cursor over a packet payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            base: 0,
        }
    }

    /// Offset of the cursor relative to the start of the packet.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    #[track_caller]
    pub fn ensure(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::malformed(self.offset()));
        }
        Ok(())
    }

    #[track_caller]
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.pos += n;
        Ok(())
    }

    #[track_caller]
    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    #[track_caller]
    fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_bytes(N)?);
        Ok(out)
    }

    /// Everything up to the end of the packet.
    pub fn get_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    #[track_caller]
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    #[track_caller]
    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.get_array()?))
    }

    #[track_caller]
    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.get_array()?))
    }

    #[track_caller]
    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.get_array()?))
    }

    #[track_caller]
    pub fn get_u24(&mut self) -> Result<u32> {
        let b: [u8; 3] = self.get_array()?;
        Ok(u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    #[track_caller]
    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }

    #[track_caller]
    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.get_array()?))
    }

    #[track_caller]
    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_array()?))
    }

    #[track_caller]
    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.get_array()?))
    }

    #[track_caller]
    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.get_array()?))
    }

    #[track_caller]
    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.get_array()?))
    }

    /// Length-encoded integer. The NULL marker and 0xFF are not integers and fail.
    #[track_caller]
    pub fn get_lenenc_int(&mut self) -> Result<u64> {
        let start = self.offset();
        let first = self.get_u8()?;
        match first {
            0..=0xFA => Ok(u64::from(first)),
            LENENC_2 => Ok(u64::from(self.get_u16()?)),
            LENENC_3 => Ok(u64::from(self.get_u24()?)),
            LENENC_8 => self.get_u64(),
            _ => Err(Error::malformed(start)),
        }
    }

    /// Length-encoded string as raw bytes.
    #[track_caller]
    pub fn get_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.offset();
        let len = self.get_lenenc_int()?;
        let len = usize::try_from(len).map_err(|_| Error::malformed(start))?;
        self.get_bytes(len)
    }

    /// Bytes up to the next NUL; the terminator is consumed but not returned.
    #[track_caller]
    pub fn get_null_terminated(&mut self) -> Result<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::malformed(self.offset()))?;
        let bytes = &rest[..nul];
        self.pos += nul + 1;
        Ok(bytes)
    }

    /// Cursor over the next `len` bytes, keeping offsets relative to this packet.
    #[track_caller]
    pub fn sub_reader(&mut self, len: usize) -> Result<Reader<'a>> {
        let base = self.offset();
        let buf = self.get_bytes(len)?;
        Ok(Reader { buf, pos: 0, base })
    }
}

/// Protocol encoders for any [`BufMut`].
pub trait WireWrite: BufMut {
    fn put_u24_le(&mut self, value: u32) {
        self.put_slice(&value.to_le_bytes()[..3]);
    }

    fn put_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.put_u8(value as u8);
        } else if value < 1 << 16 {
            self.put_u8(LENENC_2);
            self.put_u16_le(value as u16);
        } else if value < 1 << 24 {
            self.put_u8(LENENC_3);
            WireWrite::put_u24_le(self, value as u32);
        } else {
            self.put_u8(LENENC_8);
            self.put_u64_le(value);
        }
    }

    fn put_lenenc_bytes(&mut self, bytes: &[u8]) {
        self.put_lenenc_int(bytes.len() as u64);
        self.put_slice(bytes);
    }

    fn put_null_terminated(&mut self, bytes: &[u8]) {
        self.put_slice(bytes);
        self.put_u8(0);
    }
}

impl<T: BufMut + ?Sized> WireWrite for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use bytes::BytesMut;
    use rand::Rng;

    fn lenenc(value: u64) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_lenenc_int(value);
        buf
    }

    #[test]
    fn test_read_lenenc_int_1byte() {
        let mut reader = Reader::new(&[0x0a]);
        assert_eq!(reader.get_lenenc_int().unwrap(), 10);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_read_lenenc_int_2byte() {
        let mut reader = Reader::new(&[0xfc, 0x01, 0x02]);
        assert_eq!(reader.get_lenenc_int().unwrap(), 0x0201);
    }

    #[test]
    fn test_read_lenenc_int_3byte() {
        let mut reader = Reader::new(&[0xfd, 0x01, 0x02, 0x03]);
        assert_eq!(reader.get_lenenc_int().unwrap(), 0x030201);
    }

    #[test]
    fn test_lenenc_width_boundaries() {
        let cases = [
            (0u64, 1usize),
            (250, 1),
            (251, 3),
            (65535, 3),
            (65536, 4),
            (16_777_215, 4),
            (16_777_216, 9),
            (u64::MAX, 9),
        ];
        for (value, width) in cases {
            let buf = lenenc(value);
            assert_eq!(buf.len(), width, "width of {value}");
            assert_eq!(lenenc_len(value), width);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.get_lenenc_int().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_lenenc_truncated_reports_boundary() {
        let cases: [&[u8]; 3] = [&[0xfc, 0x01], &[0xfd, 0x01, 0x02], &[0xfe, 1, 2, 3, 4, 5, 6, 7]];
        for truncated in cases {
            let mut reader = Reader::new(truncated);
            let err = reader.get_lenenc_int().unwrap_err();
            assert!(err.is(ErrorCode::MalformedPacket));
            assert_eq!(err.message(), "Malformed packet (Offset 1)");
        }
    }

    #[test]
    fn test_lenenc_invalid_markers() {
        assert!(Reader::new(&[0xff]).get_lenenc_int().is_err());
        assert!(Reader::new(&[NULL_MARKER]).get_lenenc_int().is_err());
        assert!(Reader::new(&[]).get_lenenc_int().is_err());
    }

    #[test]
    fn test_lenenc_string_past_end() {
        let mut reader = Reader::new(&[0x05, b'a', b'b']);
        let err = reader.get_lenenc_bytes().unwrap_err();
        assert_eq!(err.message(), "Malformed packet (Offset 1)");
    }

    #[test]
    fn test_fixed_width_boundaries() {
        let mut buf = BytesMut::new();
        buf.put_u8(u8::MAX);
        buf.put_i8(i8::MIN);
        buf.put_u16_le(u16::MAX);
        buf.put_i16_le(i16::MIN);
        buf.put_u24_le(0xFF_FFFF);
        buf.put_u32_le(u32::MAX);
        buf.put_i32_le(i32::MIN);
        buf.put_u64_le(u64::MAX);
        buf.put_i64_le(i64::MIN);
        buf.put_f32_le(f32::MIN_POSITIVE);
        buf.put_f64_le(f64::MAX);

        let mut r = Reader::new(&buf);
        assert_eq!(r.get_u8().unwrap(), u8::MAX);
        assert_eq!(r.get_i8().unwrap(), i8::MIN);
        assert_eq!(r.get_u16().unwrap(), u16::MAX);
        assert_eq!(r.get_i16().unwrap(), i16::MIN);
        assert_eq!(r.get_u24().unwrap(), 0xFF_FFFF);
        assert_eq!(r.get_u32().unwrap(), u32::MAX);
        assert_eq!(r.get_i32().unwrap(), i32::MIN);
        assert_eq!(r.get_u64().unwrap(), u64::MAX);
        assert_eq!(r.get_i64().unwrap(), i64::MIN);
        assert_eq!(r.get_f32().unwrap(), f32::MIN_POSITIVE);
        assert_eq!(r.get_f64().unwrap(), f64::MAX);
        assert!(r.is_empty());
        assert!(r.get_u8().is_err());
    }

    #[test]
    fn test_random_values_roundtrip() {
        let mut rng = rand::rng();
        for _ in 0..256 {
            let a: i32 = rng.random();
            let b: u64 = rng.random();
            let c: f64 = rng.random();
            let d: f32 = rng.random();

            let mut buf = BytesMut::new();
            buf.put_i32_le(a);
            buf.put_lenenc_int(b);
            buf.put_f64_le(c);
            buf.put_f32_le(d);

            let mut r = Reader::new(&buf);
            assert_eq!(r.get_i32().unwrap(), a);
            assert_eq!(r.get_lenenc_int().unwrap(), b);
            assert_eq!(r.get_f64().unwrap(), c);
            assert_eq!(r.get_f32().unwrap(), d);
        }
    }

    #[test]
    fn test_null_terminated() {
        let mut reader = Reader::new(b"root\0rest");
        assert_eq!(reader.get_null_terminated().unwrap(), b"root");
        assert_eq!(reader.get_rest(), b"rest");

        let mut unterminated = Reader::new(b"abc");
        assert!(unterminated.get_null_terminated().is_err());
    }

    #[test]
    fn test_sub_reader_offsets() {
        let mut reader = Reader::new(&[1, 2, 3, 4]);
        reader.skip(1).unwrap();
        let mut sub = reader.sub_reader(2).unwrap();
        assert_eq!(sub.offset(), 1);
        sub.skip(2).unwrap();
        let err = sub.get_u8().unwrap_err();
        assert_eq!(err.message(), "Malformed packet (Offset 3)");
        assert_eq!(reader.get_u8().unwrap(), 4);
    }
}

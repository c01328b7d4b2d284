//! Canonical binary encoding.
//!
//! Every consensus identifier is a digest of this encoding, so it must be
//! byte-stable across nodes: integers are little-endian, variable-length
//! fields carry a little-endian `u64` length prefix, and tagged sums encode as
//! `u8 tag ‖ u64 length ‖ body` so that unknown tags can be carried verbatim.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::ConsensusError;

/// Decoded lengths are bounded by the size of the input, and additionally by
/// this cap so a short malicious prefix cannot request a huge allocation.
const MAX_DECODE_ALLOC: u64 = 1 << 24;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("declared length {0} is out of range")]
    LengthOutOfRange(u64),
    #[error("trailing bytes after decoded object")]
    TrailingBytes,
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl From<DecodeError> for ConsensusError {
    fn from(err: DecodeError) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

/// Append-only encoder over a byte buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u64(&mut self, v: u64) {
        let mut raw = [0u8; 8];
        LittleEndian::write_u64(&mut raw, v);
        self.buf.extend_from_slice(&raw);
    }

    /// Raw bytes, no length prefix. For fixed-size fields.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed byte slice.
    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.write_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }
}

/// Cursor-style decoder over a byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let raw = self.read_raw(1)?;
        Ok(raw[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(DecodeError::InvalidValue(format!("bool byte {v}"))),
        }
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let raw = self.read_raw(8)?;
        Ok(LittleEndian::read_u64(raw))
    }

    /// A `count` of items about to be decoded; bounded by the remaining input
    /// so a bogus prefix cannot drive a huge reservation.
    pub fn read_count(&mut self) -> Result<usize, DecodeError> {
        let count = self.read_u64()?;
        if count > MAX_DECODE_ALLOC || count > self.remaining() as u64 {
            return Err(DecodeError::LengthOutOfRange(count));
        }
        Ok(count as usize)
    }

    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEnd);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let raw = self.read_raw(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    /// Length-prefixed byte slice.
    pub fn read_slice(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u64()?;
        if len > MAX_DECODE_ALLOC || len > self.remaining() as u64 {
            return Err(DecodeError::LengthOutOfRange(len));
        }
        self.read_raw(len as usize)
    }
}

/// A value with a canonical binary form.
pub trait BinEncode {
    fn bin_encode(&self, enc: &mut Encoder);
}

/// A value decodable from its canonical binary form.
pub trait BinDecode: Sized {
    fn bin_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError>;
}

/// Encode a value into a fresh byte vector.
pub fn to_bytes<T: BinEncode + ?Sized>(value: &T) -> Vec<u8> {
    let mut enc = Encoder::new();
    value.bin_encode(&mut enc);
    enc.finish()
}

/// Length of the canonical encoding, used for size-limit accounting.
pub fn encoded_len<T: BinEncode + ?Sized>(value: &T) -> usize {
    to_bytes(value).len()
}

/// Decode a value from a byte slice, requiring full consumption.
pub fn from_bytes<T: BinDecode>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let value = T::bin_decode(&mut dec)?;
    if !dec.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}

impl BinEncode for u8 {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_u8(*self);
    }
}

impl BinDecode for u8 {
    fn bin_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.read_u8()
    }
}

impl BinEncode for u64 {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_u64(*self);
    }
}

impl BinDecode for u64 {
    fn bin_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.read_u64()
    }
}

impl<const N: usize> BinEncode for [u8; N] {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_raw(self);
    }
}

impl<const N: usize> BinDecode for [u8; N] {
    fn bin_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        dec.read_array::<N>()
    }
}

impl<T: BinEncode> BinEncode for Vec<T> {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_u64(self.len() as u64);
        for item in self {
            item.bin_encode(enc);
        }
    }
}

impl<T: BinDecode> BinDecode for Vec<T> {
    fn bin_decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let count = dec.read_count()?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::bin_decode(dec)?);
        }
        Ok(out)
    }
}

impl<T: BinEncode> BinEncode for [T] {
    fn bin_encode(&self, enc: &mut Encoder) {
        enc.write_u64(self.len() as u64);
        for item in self {
            item.bin_encode(enc);
        }
    }
}

//! Bounded byte buffers with explicit read and write cursors.
//!
//! Record parsing and encoding are transactional at the record level: a
//! [`ReadTxn`]/[`WriteTxn`] restores the cursor on drop unless it was
//! committed, so a failed decode leaves the buffer exactly where it was and
//! the caller is free to retry once more bytes arrive.

use std::ops::{Deref, DerefMut};

use bytes::BytesMut;
use snafu::Snafu;

/// Why a decode stopped.
///
/// `NotEnough` is retryable: the frame is merely incomplete and the cursor
/// has been restored. `Corrupt` is terminal for the containing stream; the
/// caller decides whether to skip ahead or abandon the source.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    #[snafu(display("need {needed} more byte(s) at offset {offset}"))]
    NotEnough { offset: usize, needed: usize },

    #[snafu(display("corrupt frame at offset {offset}: {reason}"))]
    Corrupt { offset: usize, reason: &'static str },
}

impl DecodeError {
    /// True when feeding more bytes may allow the decode to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DecodeError::NotEnough { .. })
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum EncodeError {
    #[snafu(display("write of {needed} byte(s) exceeds remaining capacity {remaining}"))]
    NoCapacity { needed: usize, remaining: usize },
}

/// Little-endian primitive reads over a byte slice, tracking a cursor.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! get_primitive {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, DecodeError> {
            let bytes = self.get_bytes(std::mem::size_of::<$ty>())?;
            Ok(<$ty>::from_le_bytes(bytes.try_into().expect("sized slice")))
        }
    };
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take the next `n` bytes, or fail without moving the cursor.
    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return NotEnoughSnafu {
                offset: self.pos,
                needed: n - self.remaining(),
            }
            .fail();
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    get_primitive!(get_u8, u8);
    get_primitive!(get_u16, u16);
    get_primitive!(get_u32, u32);
    get_primitive!(get_i32, i32);
    get_primitive!(get_i64, i64);

    /// Read a length-prefixed string, truncating to at most `cap` bytes.
    /// Fails only when the buffer holds fewer bytes than the declared
    /// length; over-long content is silently clipped.
    pub fn get_string(&mut self, cap: usize) -> Result<String, DecodeError> {
        let len = self.get_u16()? as usize;
        let bytes = self.get_bytes(len)?;
        let kept = &bytes[..len.min(cap)];
        Ok(String::from_utf8_lossy(kept).into_owned())
    }

    /// Open a savepoint; the cursor rewinds to the current position when the
    /// guard is dropped without [`ReadTxn::commit`].
    pub fn begin(&mut self) -> ReadTxn<'_, 'a> {
        let mark = self.pos;
        ReadTxn {
            reader: self,
            mark,
            committed: false,
        }
    }
}

pub struct ReadTxn<'r, 'a> {
    reader: &'r mut Reader<'a>,
    mark: usize,
    committed: bool,
}

impl ReadTxn<'_, '_> {
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ReadTxn<'_, '_> {
    fn drop(&mut self) {
        if !self.committed {
            self.reader.pos = self.mark;
        }
    }
}

impl<'a> Deref for ReadTxn<'_, 'a> {
    type Target = Reader<'a>;

    fn deref(&self) -> &Reader<'a> {
        self.reader
    }
}

impl<'a> DerefMut for ReadTxn<'_, 'a> {
    fn deref_mut(&mut self) -> &mut Reader<'a> {
        self.reader
    }
}

/// Little-endian primitive writes into a `BytesMut`, bounded by a byte
/// capacity so a single over-large record cannot grow a message without
/// limit.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut BytesMut,
    limit: usize,
}

macro_rules! put_primitive {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, value: $ty) -> Result<(), EncodeError> {
            self.put_bytes(&value.to_le_bytes())
        }
    };
}

impl<'a> Writer<'a> {
    /// Wrap `buf`, allowing it to grow up to `limit` bytes in total
    /// (including anything already present).
    pub fn new(buf: &'a mut BytesMut, limit: usize) -> Self {
        Writer { buf, limit }
    }

    pub fn written(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        if bytes.len() > self.remaining() {
            return NoCapacitySnafu {
                needed: bytes.len(),
                remaining: self.remaining(),
            }
            .fail();
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    put_primitive!(put_u8, u8);
    put_primitive!(put_u16, u16);
    put_primitive!(put_u32, u32);
    put_primitive!(put_i32, i32);
    put_primitive!(put_i64, i64);

    /// Write a length-prefixed string, truncating to at most `cap` bytes on
    /// a character boundary.
    pub fn put_string(&mut self, s: &str, cap: usize) -> Result<(), EncodeError> {
        let mut cut = cap.min(s.len());
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.put_u16(cut as u16)?;
        self.put_bytes(&s.as_bytes()[..cut])
    }

    /// Open a savepoint; bytes written after this point are discarded when
    /// the guard is dropped without [`WriteTxn::commit`].
    pub fn begin(&mut self) -> WriteTxn<'_, 'a> {
        let mark = self.buf.len();
        WriteTxn {
            writer: self,
            mark,
            committed: false,
        }
    }
}

pub struct WriteTxn<'w, 'a> {
    writer: &'w mut Writer<'a>,
    mark: usize,
    committed: bool,
}

impl WriteTxn<'_, '_> {
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for WriteTxn<'_, '_> {
    fn drop(&mut self) {
        if !self.committed {
            self.writer.buf.truncate(self.mark);
        }
    }
}

impl<'a> Deref for WriteTxn<'_, 'a> {
    type Target = Writer<'a>;

    fn deref(&self) -> &Writer<'a> {
        self.writer
    }
}

impl<'a> DerefMut for WriteTxn<'_, 'a> {
    fn deref_mut(&mut self) -> &mut Writer<'a> {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_fails_without_moving() {
        let data = [1u8, 2, 3];
        let mut reader = Reader::new(&data);

        assert_eq!(reader.get_u16().unwrap(), 0x0201);
        let err = reader.get_u32().unwrap_err();
        assert_eq!(
            err,
            DecodeError::NotEnough {
                offset: 2,
                needed: 3
            }
        );
        assert!(err.is_retryable());
        assert_eq!(reader.position(), 2);
        assert_eq!(reader.get_u8().unwrap(), 3);
    }

    #[test]
    fn read_txn_rewinds_on_drop() {
        let data = [7u8, 8, 9];
        let mut reader = Reader::new(&data);

        {
            let mut txn = reader.begin();
            assert_eq!(txn.get_u16().unwrap(), 0x0807);
            // dropped uncommitted
        }
        assert_eq!(reader.position(), 0);

        let txn = {
            let mut txn = reader.begin();
            txn.get_u8().unwrap();
            txn
        };
        txn.commit();
        assert_eq!(reader.position(), 1);
    }

    #[test]
    fn writer_respects_limit() {
        let mut buf = BytesMut::new();
        let mut writer = Writer::new(&mut buf, 5);

        writer.put_u32(0xdead_beef).unwrap();
        let err = writer.put_u16(1).unwrap_err();
        assert_eq!(
            err,
            EncodeError::NoCapacity {
                needed: 2,
                remaining: 1
            }
        );
        writer.put_u8(0xff).unwrap();
        assert_eq!(&buf[..], &[0xef, 0xbe, 0xad, 0xde, 0xff]);
    }

    #[test]
    fn write_txn_truncates_on_drop() {
        let mut buf = BytesMut::new();
        let mut writer = Writer::new(&mut buf, 16);
        writer.put_u8(1).unwrap();

        {
            let mut txn = writer.begin();
            txn.put_u32(2).unwrap();
        }
        assert_eq!(writer.written(), 1);
    }

    #[test]
    fn string_truncates_to_cap() {
        let mut buf = BytesMut::new();
        let mut writer = Writer::new(&mut buf, 64);
        writer.put_string("hello world", 5).unwrap();

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.get_string(128).unwrap(), "hello");

        // the read side clips independently of the write side
        let mut buf2 = BytesMut::new();
        let mut writer2 = Writer::new(&mut buf2, 64);
        writer2.put_string("hello world", 128).unwrap();
        let mut reader2 = Reader::new(&buf2);
        assert_eq!(reader2.get_string(5).unwrap(), "hello");
    }

    #[test]
    fn string_underflow_is_not_enough() {
        let mut buf = BytesMut::new();
        let mut writer = Writer::new(&mut buf, 64);
        writer.put_u16(10).unwrap(); // declares 10 bytes, provides 2
        writer.put_bytes(b"ab").unwrap();

        let mut reader = Reader::new(&buf);
        assert!(reader.get_string(128).unwrap_err().is_retryable());
    }
}

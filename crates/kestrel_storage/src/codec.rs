//! Varint framing shared by file headers, the transaction log and key-index
//! checkpoints.
//!
//! Unsigned integers are LEB128; signed integers are zigzag-mapped first so
//! small negative sizes (compressed payloads) stay short.

use kestrel_common::error::StorageError;

pub fn write_vu64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub fn write_vu32(buf: &mut Vec<u8>, v: u32) {
    write_vu64(buf, v as u64);
}

pub fn write_vi64(buf: &mut Vec<u8>, v: i64) {
    write_vu64(buf, ((v << 1) ^ (v >> 63)) as u64);
}

pub fn write_vi32(buf: &mut Vec<u8>, v: i32) {
    write_vi64(buf, v as i64);
}

/// Cursor over an in-memory file image.
///
/// Every read that runs past the end reports `UnexpectedEof` with the
/// absolute offset where the short read began, which replay treats as a
/// torn write.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), StorageError> {
        if pos as usize > self.data.len() {
            return Err(StorageError::UnexpectedEof(pos));
        }
        self.pos = pos as usize;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, StorageError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(StorageError::UnexpectedEof(self.pos as u64))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, StorageError> {
        let bytes = self.read_block(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_block(&mut self, len: usize) -> Result<&'a [u8], StorageError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(StorageError::UnexpectedEof(self.pos as u64))?;
        let block = &self.data[self.pos..end];
        self.pos = end;
        Ok(block)
    }

    /// Consume `magic` or report whether it mismatched. A short read is
    /// still an error.
    pub fn check_magic(&mut self, magic: &[u8]) -> Result<bool, StorageError> {
        Ok(self.read_block(magic.len())? == magic)
    }

    pub fn read_vu64(&mut self) -> Result<u64, StorageError> {
        let start = self.pos as u64;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.read_u8()?;
            if shift == 63 && b > 1 {
                return Err(StorageError::Corrupted(format!(
                    "varint overflow at offset {}",
                    start
                )));
            }
            result |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_vu32(&mut self) -> Result<u32, StorageError> {
        let start = self.pos as u64;
        let v = self.read_vu64()?;
        u32::try_from(v).map_err(|_| {
            StorageError::Corrupted(format!("u32 varint out of range at offset {}", start))
        })
    }

    pub fn read_vi64(&mut self) -> Result<i64, StorageError> {
        let v = self.read_vu64()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    pub fn read_vi32(&mut self) -> Result<i32, StorageError> {
        let start = self.pos as u64;
        let v = self.read_vi64()?;
        i32::try_from(v).map_err(|_| {
            StorageError::Corrupted(format!("i32 varint out of range at offset {}", start))
        })
    }

    /// Length prefix that must fit in memory; guards against garbage
    /// lengths allocating gigabytes.
    pub fn read_length(&mut self) -> Result<usize, StorageError> {
        let start = self.pos as u64;
        let len = self.read_vu64()? as usize;
        if len > self.remaining() {
            return Err(StorageError::UnexpectedEof(start));
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_boundaries() {
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_vu64(&mut buf, v);
            assert!(buf.len() <= 10);
            let mut r = ByteReader::new(&buf);
            assert_eq!(r.read_vu64().unwrap(), v);
            assert!(r.is_eof());
        }
    }

    #[test]
    fn test_signed_small_values_are_short() {
        let mut buf = Vec::new();
        write_vi32(&mut buf, -1);
        assert_eq!(buf.len(), 1);
        write_vi32(&mut buf, i32::MIN);
        write_vi32(&mut buf, i32::MAX);
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_vi32().unwrap(), -1);
        assert_eq!(r.read_vi32().unwrap(), i32::MIN);
        assert_eq!(r.read_vi32().unwrap(), i32::MAX);
    }

    #[test]
    fn test_short_read_reports_offset() {
        let buf = [0x80u8, 0x80];
        let mut r = ByteReader::new(&buf);
        match r.read_vu64() {
            Err(StorageError::UnexpectedEof(off)) => assert_eq!(off, 2),
            other => panic!("expected eof, got {:?}", other),
        }
    }

    #[test]
    fn test_read_block_past_end() {
        let buf = [1u8, 2, 3];
        let mut r = ByteReader::new(&buf);
        r.read_block(1).unwrap();
        assert!(matches!(r.read_block(5), Err(StorageError::UnexpectedEof(1))));
        assert_eq!(r.read_block(2).unwrap(), &[2, 3]);
    }

    #[test]
    fn test_vu32_out_of_range() {
        let mut buf = Vec::new();
        write_vu64(&mut buf, u32::MAX as u64 + 1);
        assert!(matches!(
            ByteReader::new(&buf).read_vu32(),
            Err(StorageError::Corrupted(_))
        ));
    }
}

//! Value locations and the inline value codec.
//!
//! A value of at most [`MAX_INLINE_VALUE_LEN`] bytes is never written to a
//! value file: its bytes are packed into the location descriptor itself.
//! The packed layout is
//!
//! ```text
//! size   = len << 24 | b0 << 16 | b1 << 8 | b2
//! offset = b3 | b4 << 8 | b5 << 16 | b6 << 24
//! ```
//!
//! with `file_id == 0`. Values stored in files keep `size` as their byte
//! length, negated when the payload went through the compression codec.

use kestrel_common::error::StorageError;
use kestrel_common::types::FileId;

pub const MAX_INLINE_VALUE_LEN: usize = 7;

/// Where a value lives: a file + offset + signed size, or inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueLocation {
    pub file_id: FileId,
    pub offset: u32,
    pub size: i32,
}

impl ValueLocation {
    pub const EMPTY: ValueLocation = ValueLocation {
        file_id: FileId::NONE,
        offset: 0,
        size: 0,
    };

    pub fn in_file(file_id: FileId, offset: u32, stored_len: usize, compressed: bool) -> Self {
        let size = stored_len as i32;
        Self {
            file_id,
            offset,
            size: if compressed { -size } else { size },
        }
    }

    pub fn is_inline(&self) -> bool {
        self.file_id.is_none()
    }

    pub fn is_compressed(&self) -> bool {
        !self.is_inline() && self.size < 0
    }

    /// Bytes occupied in the value file (0 for inline values).
    pub fn stored_len(&self) -> u64 {
        if self.is_inline() {
            0
        } else {
            self.size.unsigned_abs() as u64
        }
    }

    /// Length of the value as stored, without reading it. For compressed
    /// values this is the compressed length.
    pub fn value_len(&self) -> usize {
        if self.size == 0 {
            0
        } else if self.is_inline() {
            ((self.size as u32) >> 24) as usize
        } else {
            self.size.unsigned_abs() as usize
        }
    }
}

pub fn can_inline(value: &[u8]) -> bool {
    value.len() <= MAX_INLINE_VALUE_LEN
}

/// Pack a short value into a location.
pub fn encode_inline(value: &[u8]) -> Result<ValueLocation, StorageError> {
    let len = value.len();
    if len > MAX_INLINE_VALUE_LEN {
        return Err(StorageError::MalformedInlineValue(len));
    }
    if len == 0 {
        return Ok(ValueLocation::EMPTY);
    }
    let byte = |i: usize| value.get(i).copied().unwrap_or(0) as u32;
    let size = ((len as u32) << 24) | (byte(0) << 16) | (byte(1) << 8) | byte(2);
    let offset = byte(3) | (byte(4) << 8) | (byte(5) << 16) | (byte(6) << 24);
    Ok(ValueLocation {
        file_id: FileId::NONE,
        offset,
        size: size as i32,
    })
}

/// Unpack an inline location back into the value bytes.
pub fn decode_inline(loc: &ValueLocation) -> Result<Vec<u8>, StorageError> {
    let size = loc.size as u32;
    let len = (size >> 24) as usize;
    if len > MAX_INLINE_VALUE_LEN {
        return Err(StorageError::MalformedInlineValue(len));
    }
    let packed = [
        (size >> 16) as u8,
        (size >> 8) as u8,
        size as u8,
        loc.offset as u8,
        (loc.offset >> 8) as u8,
        (loc.offset >> 16) as u8,
        (loc.offset >> 24) as u8,
    ];
    Ok(packed[..len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_value_is_all_zero() {
        let loc = encode_inline(&[]).unwrap();
        assert_eq!(loc, ValueLocation::EMPTY);
        assert!(decode_inline(&loc).unwrap().is_empty());
        assert_eq!(loc.value_len(), 0);
    }

    #[test]
    fn test_every_length_with_high_bytes() {
        for len in 0..=MAX_INLINE_VALUE_LEN {
            let value: Vec<u8> = (0..len).map(|i| 0xF9 - i as u8).collect();
            let loc = encode_inline(&value).unwrap();
            assert!(loc.is_inline());
            assert_eq!(loc.value_len(), len);
            assert_eq!(decode_inline(&loc).unwrap(), value);
        }
    }

    #[test]
    fn test_eight_bytes_never_inline() {
        assert!(!can_inline(&[0u8; 8]));
        assert!(matches!(
            encode_inline(&[0u8; 8]),
            Err(StorageError::MalformedInlineValue(8))
        ));
    }

    #[test]
    fn test_malformed_length_rejected() {
        let loc = ValueLocation {
            file_id: FileId::NONE,
            offset: 0,
            size: (9u32 << 24) as i32,
        };
        assert!(matches!(
            decode_inline(&loc),
            Err(StorageError::MalformedInlineValue(9))
        ));
    }

    #[test]
    fn test_file_location_sizes() {
        let loc = ValueLocation::in_file(FileId(3), 100, 40, true);
        assert!(loc.is_compressed());
        assert_eq!(loc.size, -40);
        assert_eq!(loc.stored_len(), 40);
        assert_eq!(loc.value_len(), 40);
        let loc = ValueLocation::in_file(FileId(3), 100, 40, false);
        assert!(!loc.is_compressed());
    }

    proptest! {
        #[test]
        fn prop_inline_roundtrip(value in proptest::collection::vec(any::<u8>(), 0..=MAX_INLINE_VALUE_LEN)) {
            let loc = encode_inline(&value).unwrap();
            prop_assert!(loc.is_inline());
            prop_assert_eq!(decode_inline(&loc).unwrap(), value);
        }

        #[test]
        fn prop_long_values_rejected(value in proptest::collection::vec(any::<u8>(), 8..64)) {
            prop_assert!(!can_inline(&value));
            prop_assert!(encode_inline(&value).is_err());
        }
    }
}

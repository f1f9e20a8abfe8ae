//! Script numbers and truthiness
//!
//! Numbers are little-endian sign-magnitude byte strings; arithmetic operands
//! are limited to 4 bytes (5 for lock-time operands).

use super::ScriptError;

pub const DEFAULT_MAX_NUM_SIZE: usize = 4;
pub const LOCKTIME_MAX_NUM_SIZE: usize = 5;

pub fn decode_num(bytes: &[u8], max_size: usize) -> Result<i64, ScriptError> {
    if bytes.len() > max_size {
        return Err(ScriptError::NumberOverflow(bytes.len()));
    }
    let Some((&last, _)) = bytes.split_last() else {
        return Ok(0);
    };

    let mut value: i64 = 0;
    for (index, byte) in bytes.iter().enumerate() {
        value |= (*byte as i64) << (8 * index);
    }
    if last & 0x80 != 0 {
        let magnitude = value & !(0x80i64 << (8 * (bytes.len() - 1)));
        return Ok(-magnitude);
    }
    Ok(value)
}

pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }

    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut bytes = Vec::with_capacity(9);
    while magnitude > 0 {
        bytes.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }

    // The most significant byte carries the sign bit; add a byte if it is taken
    if let Some(last) = bytes.last_mut() {
        if *last & 0x80 != 0 {
            bytes.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            *last |= 0x80;
        }
    }
    bytes
}

/// Any non-zero byte is true, except a lone sign bit in the last byte (negative zero)
pub fn cast_to_bool(bytes: &[u8]) -> bool {
    for (index, byte) in bytes.iter().enumerate() {
        if *byte != 0 {
            return !(index == bytes.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Strip redundant trailing zero bytes, preserving the sign
pub fn minimally_encode(mut bytes: Vec<u8>) -> Vec<u8> {
    let Some(&last) = bytes.last() else {
        return bytes;
    };
    if last & 0x7f != 0 {
        return bytes;
    }
    if bytes.len() == 1 {
        return Vec::new();
    }
    if bytes[bytes.len() - 2] & 0x80 != 0 {
        return bytes;
    }

    let sign = last & 0x80;
    let mut index = bytes.len() - 1;
    while index > 0 {
        if bytes[index - 1] != 0 {
            if bytes[index - 1] & 0x80 != 0 {
                bytes[index] = sign;
                bytes.truncate(index + 1);
            } else {
                bytes[index - 1] |= sign;
                bytes.truncate(index);
            }
            return bytes;
        }
        index -= 1;
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode_num(0), Vec::<u8>::new());
        assert_eq!(encode_num(1), vec![0x01]);
        assert_eq!(encode_num(-1), vec![0x81]);
        assert_eq!(encode_num(127), vec![0x7f]);
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_num(-128), vec![0x80, 0x80]);
        assert_eq!(encode_num(255), vec![0xff, 0x00]);
    }

    #[test]
    fn test_decode_rejects_oversized_operands() {
        assert!(decode_num(&[1, 2, 3, 4, 5], DEFAULT_MAX_NUM_SIZE).is_err());
        assert_eq!(decode_num(&[1, 2, 3, 4, 5], LOCKTIME_MAX_NUM_SIZE).unwrap(), 0x0504030201);
    }

    #[test]
    fn test_non_minimal_encodings_still_decode() {
        assert_eq!(decode_num(&[0x01, 0x00], 4).unwrap(), 1);
        assert_eq!(decode_num(&[0x80], 4).unwrap(), 0);
    }

    #[test]
    fn test_cast_to_bool() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0x00, 0x00]));
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x80, 0x00]));
        assert!(cast_to_bool(&[0x01]));
    }

    #[test]
    fn test_minimally_encode() {
        assert_eq!(minimally_encode(vec![0x01, 0x00, 0x00]), vec![0x01]);
        assert_eq!(minimally_encode(vec![0x01, 0x00, 0x80]), vec![0x81]);
        assert_eq!(minimally_encode(vec![0x80, 0x00]), vec![0x80, 0x00]);
        assert_eq!(minimally_encode(vec![0x00, 0x80]), Vec::<u8>::new());
        assert_eq!(minimally_encode(vec![0xff, 0x00, 0x00]), vec![0xff, 0x00]);
    }

    proptest! {
        #[test]
        fn prop_four_byte_numbers_round_trip(value in -0x7fff_ffffi64..=0x7fff_ffffi64) {
            let encoded = encode_num(value);
            prop_assert!(encoded.len() <= DEFAULT_MAX_NUM_SIZE);
            prop_assert_eq!(decode_num(&encoded, DEFAULT_MAX_NUM_SIZE).unwrap(), value);
            prop_assert_eq!(minimally_encode(encoded.clone()), encoded);
        }
    }
}

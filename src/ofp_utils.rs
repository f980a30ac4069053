use std::io::Cursor;

use byteorder::{ReadBytesExt, WriteBytesExt};
use bytes::Buf;

use crate::ofp_message::OfpSerializationError;

pub fn write_padding_bytes(bytes: &mut Vec<u8>, count: usize) {
    for _ in 0..count {
        bytes.write_u8(0).unwrap();
    }
}

/// Read a fixed-size, zero-terminated string field; always consumes
/// `capacity` bytes.
pub fn read_fixed_size_string(
    bytes: &mut Cursor<Vec<u8>>,
    capacity: usize,
) -> Result<String, OfpSerializationError> {
    if bytes.remaining() < capacity {
        return Err(OfpSerializationError::UnexpectedValueError {
            value: format!("{} bytes remaining", bytes.remaining()),
            field: "string".to_string(),
            message: format!("fixed size string of {} bytes", capacity),
        });
    }

    let mut arr = Vec::with_capacity(capacity);
    let mut read_count = 0;
    for _ in 0..capacity {
        read_count += 1;
        let next_char = bytes.read_u8()?;
        if next_char == 0 {
            break;
        }
        arr.push(next_char);
    }
    Buf::advance(bytes, capacity - read_count);

    String::from_utf8(arr).map_err(|e| OfpSerializationError::UnexpectedValueError {
        value: e.to_string(),
        field: "string".to_string(),
        message: "fixed size string".to_string(),
    })
}

/// Write a string into a fixed-size field, zero-padded, truncated to
/// `capacity - 1` so the terminator always fits.
pub fn write_fixed_size_string(bytes: &mut Vec<u8>, value: &str, capacity: usize) {
    let data = value.as_bytes();
    let len = data.len().min(capacity - 1);
    bytes.extend_from_slice(&data[..len]);
    write_padding_bytes(bytes, capacity - len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size_string_round_trip() {
        let mut bytes = vec![];
        write_fixed_size_string(&mut bytes, "port_1", 16);
        assert_eq!(bytes.len(), 16);

        let mut cursor = Cursor::new(bytes);
        let text = read_fixed_size_string(&mut cursor, 16).unwrap();
        assert_eq!(text, "port_1");
    }

    #[test]
    fn test_fixed_size_string_truncates() {
        let mut bytes = vec![];
        write_fixed_size_string(&mut bytes, "a-very-long-interface-name", 16);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[15], 0);
    }
}

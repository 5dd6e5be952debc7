//! SSH binary wire encoding primitives (RFC 4251 Section 5).
//!
//! All multi-byte integers are big-endian. The readers take the input slice
//! and a cursor; on success the cursor has advanced past the consumed bytes,
//! so the remainder of the input stays available to the caller. Every reader
//! fails with [`SkiffError::MalformedMessage`] on truncation or a length
//! prefix that runs past the end of the input, and never allocates beyond
//! the bounds its length prefixes describe.
//!
//! # Encodings
//!
//! - **byte-string**: 4-byte length N, then N bytes
//! - **mpint**: 4-byte length, two's-complement big-endian body, minimally
//!   encoded with a leading 0x00 when the top bit of a positive number is
//!   set
//! - **tuple-list**: 4-byte outer length, then (name, data) byte-string
//!   pairs until the outer length is consumed

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

fn truncated(what: &str, offset: usize) -> SkiffError {
    SkiffError::MalformedMessage(format!("truncated {} at offset {}", what, offset))
}

/// Reads a single byte.
pub fn read_u8(data: &[u8], offset: &mut usize) -> SkiffResult<u8> {
    if *offset >= data.len() {
        return Err(truncated("u8", *offset));
    }
    let value = data[*offset];
    *offset += 1;
    Ok(value)
}

/// Reads an SSH boolean: a single byte, zero meaning false.
pub fn read_bool(data: &[u8], offset: &mut usize) -> SkiffResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads a big-endian uint32.
pub fn read_u32(data: &[u8], offset: &mut usize) -> SkiffResult<u32> {
    if *offset + 4 > data.len() {
        return Err(truncated("u32", *offset));
    }
    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(value)
}

/// Reads a big-endian uint64.
pub fn read_u64(data: &[u8], offset: &mut usize) -> SkiffResult<u64> {
    if *offset + 8 > data.len() {
        return Err(truncated("u64", *offset));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(bytes))
}

/// Reads a length-prefixed byte-string.
pub fn read_string(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<u8>> {
    let length = read_u32(data, offset)? as usize;
    if *offset + length > data.len() {
        return Err(SkiffError::MalformedMessage(format!(
            "byte-string of {} bytes at offset {} runs past end of input",
            length, offset
        )));
    }
    let bytes = data[*offset..*offset + length].to_vec();
    *offset += length;
    Ok(bytes)
}

/// Reads a length-prefixed byte-string and requires it to be UTF-8.
pub fn read_string_utf8(data: &[u8], offset: &mut usize) -> SkiffResult<String> {
    let bytes = read_string(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| SkiffError::MalformedMessage("string contains invalid UTF-8".to_string()))
}

/// Reads an mpint and returns its body bytes (big-endian magnitude, possibly
/// carrying the sign-extension 0x00 the encoder added).
pub fn read_mpint(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<u8>> {
    read_string(data, offset)
}

/// Reads a tuple-list: an outer byte-string containing (name, data)
/// byte-string pairs until the outer length is consumed.
pub fn read_tuple_list(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<(String, Vec<u8>)>> {
    let list = read_string(data, offset)?;
    let mut out = Vec::new();
    let mut inner = 0usize;
    while inner < list.len() {
        let name = read_string_utf8(&list, &mut inner)?;
        let data = read_string(&list, &mut inner)?;
        out.push((name, data));
    }
    Ok(out)
}

/// Writes a single byte.
pub fn write_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

/// Writes an SSH boolean.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a big-endian uint32.
pub fn write_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

/// Writes a big-endian uint64.
pub fn write_u64(buf: &mut BytesMut, value: u64) {
    buf.put_u64(value);
}

/// Writes a length-prefixed byte-string.
pub fn write_string(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes a tuple-list.
pub fn write_tuple_list(buf: &mut BytesMut, tuples: &[(String, Vec<u8>)]) {
    let mut inner = BytesMut::new();
    for (name, data) in tuples {
        write_string(&mut inner, name.as_bytes());
        write_string(&mut inner, data);
    }
    write_string(buf, &inner);
}

/// Encodes a big-endian magnitude as a complete mpint (length prefix
/// included): leading zeros stripped, a 0x00 sign byte prepended when the
/// top bit is set, zero encoded as four zero bytes.
pub fn mpint_bytes(magnitude: &[u8]) -> Vec<u8> {
    let trimmed: &[u8] = {
        let start = magnitude.iter().position(|&b| b != 0);
        match start {
            Some(i) => &magnitude[i..],
            None => &[],
        }
    };

    if trimmed.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let needs_padding = trimmed[0] & 0x80 != 0;
    let length = trimmed.len() + usize::from(needs_padding);

    let mut out = Vec::with_capacity(4 + length);
    out.extend_from_slice(&(length as u32).to_be_bytes());
    if needs_padding {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Writes a big-endian magnitude as an mpint.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    buf.put_slice(&mpint_bytes(magnitude));
}

/// Sanitizes peer-supplied text per RFC 4251 Section 9.2: every byte below
/// 0x20 other than tab, carriage return, and newline becomes a space.
pub fn safe_string(s: &str) -> String {
    s.bytes()
        .map(|c| {
            if c < 0x20 && c != 0x09 && c != 0x0a && c != 0x0d {
                ' '
            } else {
                c as char
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_round_trip() {
        let mut buf = BytesMut::new();
        write_u32(&mut buf, 0xdead_beef);

        let mut offset = 0;
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 0xdead_beef);
        assert_eq!(offset, 4);
    }

    #[test]
    fn test_u64_round_trip() {
        let mut buf = BytesMut::new();
        write_u64(&mut buf, u64::MAX - 7);

        let mut offset = 0;
        assert_eq!(read_u64(&buf, &mut offset).unwrap(), u64::MAX - 7);
        assert_eq!(offset, 8);
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, b"forwarded-tcpip");

        let mut offset = 0;
        assert_eq!(read_string(&buf, &mut offset).unwrap(), b"forwarded-tcpip");
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_string_truncated() {
        // Declares 10 bytes but carries 3.
        let data = [0, 0, 0, 10, b'a', b'b', b'c'];
        let mut offset = 0;
        let result = read_string(&data, &mut offset);
        assert!(matches!(result, Err(SkiffError::MalformedMessage(_))));
    }

    #[test]
    fn test_u32_truncated() {
        let data = [0, 0, 0];
        let mut offset = 0;
        assert!(read_u32(&data, &mut offset).is_err());
    }

    #[test]
    fn test_mpint_encodings() {
        // Zero is four zero bytes.
        assert_eq!(mpint_bytes(&[]), vec![0, 0, 0, 0]);
        assert_eq!(mpint_bytes(&[0, 0]), vec![0, 0, 0, 0]);

        // Top bit clear: body as-is.
        assert_eq!(mpint_bytes(&[0x12, 0x34]), vec![0, 0, 0, 2, 0x12, 0x34]);

        // Top bit set: 0x00 sign byte prepended.
        assert_eq!(mpint_bytes(&[0x80, 0x00]), vec![0, 0, 0, 3, 0, 0x80, 0x00]);

        // Leading zeros are stripped before encoding.
        assert_eq!(
            mpint_bytes(&[0x00, 0x00, 0x12, 0x34]),
            vec![0, 0, 0, 2, 0x12, 0x34]
        );
    }

    #[test]
    fn test_tuple_list_round_trip() {
        let tuples = vec![
            ("permit-X11-forwarding".to_string(), vec![]),
            ("force-command".to_string(), b"ls".to_vec()),
        ];
        let mut buf = BytesMut::new();
        write_tuple_list(&mut buf, &tuples);

        let mut offset = 0;
        let parsed = read_tuple_list(&buf, &mut offset).unwrap();
        assert_eq!(parsed, tuples);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_tuple_list_empty() {
        let mut buf = BytesMut::new();
        write_tuple_list(&mut buf, &[]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);

        let mut offset = 0;
        assert!(read_tuple_list(&buf, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn test_tuple_list_truncated_inner() {
        // Outer length 6, but the inner name declares 20 bytes.
        let data = [0, 0, 0, 6, 0, 0, 0, 20, b'x', b'y'];
        let mut offset = 0;
        assert!(read_tuple_list(&data, &mut offset).is_err());
    }

    #[test]
    fn test_safe_string() {
        assert_eq!(safe_string("a\x00b\tc\x01d\n"), "a b\tc d\n");
        assert_eq!(safe_string("plain text"), "plain text");
        assert_eq!(safe_string("\r\n\t"), "\r\n\t");
    }

    #[test]
    fn test_bool_round_trip() {
        let mut buf = BytesMut::new();
        write_bool(&mut buf, true);
        write_bool(&mut buf, false);

        let mut offset = 0;
        assert!(read_bool(&buf, &mut offset).unwrap());
        assert!(!read_bool(&buf, &mut offset).unwrap());
    }
}

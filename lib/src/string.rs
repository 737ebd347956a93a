//! Byte-buffer string helpers for fixed-size kernel names.

/// Extract a NUL-padded byte array as a `&str`.
///
/// Scans for the first NUL byte (or end of slice) and interprets the prefix
/// as UTF-8. Returns `"<invalid>"` if the bytes are not valid UTF-8.
#[inline]
pub fn bytes_as_str(buf: &[u8]) -> &str {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..len]).unwrap_or("<invalid>")
}

/// Copy `src` into a fixed NUL-padded name buffer, truncating if needed.
/// The last byte is always NUL.
pub fn copy_name(dest: &mut [u8], src: &str) {
    if dest.is_empty() {
        return;
    }
    let len = src.len().min(dest.len() - 1);
    dest[..len].copy_from_slice(&src.as_bytes()[..len]);
    for byte in dest[len..].iter_mut() {
        *byte = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_and_read_back() {
        let mut buf = [0xffu8; 8];
        copy_name(&mut buf, "idle");
        assert_eq!(bytes_as_str(&buf), "idle");
        assert_eq!(buf[7], 0);
    }

    #[test]
    fn long_names_truncate() {
        let mut buf = [0u8; 4];
        copy_name(&mut buf, "worker-long");
        assert_eq!(bytes_as_str(&buf), "wor");
    }

    #[test]
    fn unterminated_buffer_uses_full_length() {
        assert_eq!(bytes_as_str(b"abcd"), "abcd");
    }
}

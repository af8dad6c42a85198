/// Apply client line editing to a raw line.
///
/// - backspace (0x08) erases the previous kept character,
/// - other control bytes are dropped,
/// - bytes are decoded lossily as UTF-8,
/// - outer whitespace is trimmed.
pub fn clean_line(raw: &[u8]) -> String {
    let mut kept: Vec<u8> = Vec::with_capacity(raw.len());
    for &b in raw {
        match b {
            0x08 | 0x7f => {
                // Erase one whole UTF-8 scalar, not one byte.
                while let Some(last) = kept.pop() {
                    if last & 0xc0 != 0x80 {
                        break;
                    }
                }
            }
            b if b < 0x20 => {}
            b => kept.push(b),
        }
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backspace_deletes_previous_char() {
        assert_eq!(clean_line(b"lopk\x08\x08ok"), "look");
        assert_eq!(clean_line(b"\x08\x08hi"), "hi");
    }

    #[test]
    fn strips_control_chars_and_trims() {
        assert_eq!(clean_line(b"  say\x07 hi\t"), "say hi");
        assert_eq!(clean_line(b"\x1b[2Jnorth"), "[2Jnorth");
    }

    #[test]
    fn backspace_erases_multibyte_char_whole() {
        let mut raw = "caf\u{e9}".as_bytes().to_vec();
        raw.push(0x08);
        raw.push(b'e');
        assert_eq!(clean_line(&raw), "cafe");
    }

    #[test]
    fn empty_and_whitespace_lines_clean_to_empty() {
        assert_eq!(clean_line(b""), "");
        assert_eq!(clean_line(b"   \t "), "");
    }
}

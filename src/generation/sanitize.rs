//! UTF-8 repair for detokenized output
//!
//! Token pieces are raw bytes and may cut a multi-byte character in half, so
//! the accumulated output is not guaranteed to be UTF-8.

/// Placeholder emitted for each byte that does not start a valid sequence
pub const REPLACEMENT: char = '?';

/// Expected sequence length from a lead byte, `None` if it cannot start one.
fn sequence_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        b if b & 0xE0 == 0xC0 => Some(2),
        b if b & 0xF0 == 0xE0 => Some(3),
        b if b & 0xF8 == 0xF0 => Some(4),
        _ => None,
    }
}

/// Copies valid sequences through and replaces each offending byte with `?`.
///
/// After a bad byte the walk resumes at the very next byte, so a broken
/// sequence costs one placeholder per byte rather than swallowing the text
/// that follows it. The result is never longer than `bytes`.
pub fn sanitize_utf8(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let candidate = sequence_len(bytes[i])
            .and_then(|len| bytes.get(i..i + len))
            .and_then(|seq| std::str::from_utf8(seq).ok());

        match candidate {
            Some(s) => {
                out.push_str(s);
                i += s.len();
            }
            None => {
                out.push(REPLACEMENT);
                i += 1;
            }
        }
    }

    out
}

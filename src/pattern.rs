//! Rotating character pattern for RFC 864 line generation.
//!
//! The alphabet is the 95 printable ASCII characters in code-point order,
//! space through tilde. Line `n` of a connection starts at offset `n mod 95`.

use bytes::{BufMut, BytesMut};

/// Number of characters in the rotating alphabet.
pub const ALPHABET_LEN: usize = 95;

/// Printable ASCII, space (0x20) through tilde (0x7e).
pub const ALPHABET: [u8; ALPHABET_LEN] = *b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

/// Characters per line, excluding the terminator.
pub const LINE_LENGTH: usize = 72;

/// Line terminator. RFC 864 mandates CR LF.
pub const TERMINATOR: &[u8; 2] = b"\r\n";

/// Bytes on the wire for one line including its terminator.
pub const FRAME_LEN: usize = LINE_LENGTH + TERMINATOR.len();

/// Build `length` characters of the pattern starting at `start`.
///
/// Character `i` of the result is `ALPHABET[(start + i) % 95]`.
pub fn line_at(start: usize, length: usize) -> Vec<u8> {
    (0..length)
        .map(|i| ALPHABET[(start + i) % ALPHABET_LEN])
        .collect()
}

/// Build one wire frame (a full line plus CR LF) starting at `start`.
pub fn frame_at(start: usize) -> BytesMut {
    let mut frame = BytesMut::with_capacity(FRAME_LEN);
    frame.put_slice(&line_at(start, LINE_LENGTH));
    frame.put_slice(TERMINATOR);
    frame
}

/// Offset of the line that follows one starting at `start`.
pub fn next_start(start: usize) -> usize {
    (start + 1) % ALPHABET_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphabet_is_printable_ascii() {
        assert_eq!(ALPHABET.len(), 95);
        for (i, &c) in ALPHABET.iter().enumerate() {
            assert_eq!(c, 0x20 + i as u8);
        }
    }

    #[test]
    fn test_first_line() {
        let line = line_at(0, LINE_LENGTH);
        assert_eq!(
            line,
            b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefg".to_vec()
        );
    }

    #[test]
    fn test_line_wraps_around_alphabet() {
        let line = line_at(90, 10);
        assert_eq!(line, b"z{|}~ !\"#$".to_vec());
    }

    #[test]
    fn test_frame_layout() {
        let frame = frame_at(5);
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(&frame[..LINE_LENGTH], &line_at(5, LINE_LENGTH)[..]);
        assert_eq!(&frame[LINE_LENGTH..], b"\r\n");
    }

    #[test]
    fn test_next_start_rotates_by_one() {
        assert_eq!(next_start(0), 1);
        assert_eq!(next_start(93), 94);
        assert_eq!(next_start(94), 0);
    }
}

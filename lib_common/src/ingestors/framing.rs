//! # CRLF Frame Assembler
//!
//! APRS-IS delivers lines terminated by `\r\n`, but a single socket read can end
//! anywhere: in the middle of a line, between `\r` and `\n`, or inside a
//! multi-byte UTF-8 character. The assembler keeps the unterminated tail as raw
//! bytes and only decodes lines once their terminator has arrived.

use bytes::{Buf, BytesMut};

const TERMINATOR: &[u8] = b"\r\n";

/// Splits `leftover + chunk` into complete lines and the new leftover.
///
/// Lines are decoded as UTF-8 with invalid sequences dropped. The unterminated
/// tail is returned untouched.
pub fn assemble(leftover: &[u8], chunk: &[u8]) -> (Vec<String>, Vec<u8>) {
    let mut assembler = FrameAssembler::default();
    assembler.buffer.extend_from_slice(leftover);
    let lines = assembler.push(chunk);
    (lines, assembler.leftover().to_vec())
}

/// Stateful assembler carrying the partial line between reads.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
}

impl FrameAssembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and drains every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // A terminator may straddle the previous chunk, so rescan from one byte back.
        let mut search_from = self.buffer.len().saturating_sub(TERMINATOR.len() - 1);
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(offset) = find_terminator(&self.buffer[search_from..]) {
            let end = search_from + offset;
            let line = self.buffer.split_to(end);
            self.buffer.advance(TERMINATOR.len());
            lines.push(decode_lossless_subset(&line));
            search_from = 0;
        }
        lines
    }

    /// The bytes of the current unterminated line.
    pub fn leftover(&self) -> &[u8] {
        &self.buffer
    }

    /// Forgets the partial line, e.g. after a reconnect.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack.windows(TERMINATOR.len()).position(|window| window == TERMINATOR)
}

/// UTF-8 decode that drops invalid sequences instead of substituting them.
fn decode_lossless_subset(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace(char::REPLACEMENT_CHARACTER, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = "# aprsc 2.1\r\nN0CALL>APRS:!4903.50N/07201.75W-é\r\nK1ABC>APRS:>hi\r\npartial".as_bytes();

    #[test]
    fn single_read_withholds_tail() {
        let (lines, leftover) = assemble(b"", STREAM);
        assert_eq!(
            lines,
            vec!["# aprsc 2.1", "N0CALL>APRS:!4903.50N/07201.75W-é", "K1ABC>APRS:>hi"]
        );
        assert_eq!(leftover, b"partial");
    }

    #[test]
    fn every_two_way_split_yields_the_same_lines() {
        let (expected, expected_tail) = assemble(b"", STREAM);
        for cut in 0..=STREAM.len() {
            let mut assembler = FrameAssembler::new();
            let mut lines = assembler.push(&STREAM[..cut]);
            lines.extend(assembler.push(&STREAM[cut..]));
            assert_eq!(lines, expected, "split at {}", cut);
            assert_eq!(assembler.leftover(), expected_tail.as_slice());
        }
    }

    #[test]
    fn byte_by_byte_feed_matches_single_read() {
        let (expected, _) = assemble(b"", STREAM);
        let mut assembler = FrameAssembler::new();
        let lines: Vec<String> = STREAM.chunks(1).flat_map(|b| assembler.push(b)).collect();
        assert_eq!(lines, expected);
    }

    #[test]
    fn invalid_utf8_is_dropped_and_empty_lines_kept() {
        let (lines, leftover) = assemble(b"AB\xff", b"C\r\n\r\n");
        assert_eq!(lines, vec!["ABC", ""]);
        assert!(leftover.is_empty());
    }

    #[test]
    fn clear_discards_partial_line() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.push(b"half a li").is_empty());
        assembler.clear();
        assert_eq!(assembler.push(b"ne\r\n"), vec!["ne"]);
    }
}

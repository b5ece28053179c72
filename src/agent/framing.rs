//! Newline-delimited frame assembly
//!
//! A frame is the bytes of a line terminated by `\n`. Partial trailing data
//! is retained across reads; empty lines are skipped. A CR before the LF is
//! left in place — the protocol is `\n`-delimited, not CRLF.

/// Accumulates raw pipe output and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns the complete lines it finished.
    ///
    /// Lines are decoded lossily so a stray invalid byte cannot stall the
    /// stream; downstream JSON parsing rejects garbage lines anyway.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
        }
        lines
    }

    /// Bytes currently held waiting for a terminating newline.
    pub fn pending(&self) -> &[u8] {
        &self.partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_line_emitted() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed(b"{\"a\":1}\n"), vec!["{\"a\":1}"]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn partial_retained_across_feeds() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed(b"A\nB"), vec!["A"]);
        assert_eq!(buf.pending(), b"B");
        assert_eq!(buf.feed(b"C\n"), vec!["BC"]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn empty_lines_skipped() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed(b"\n\nA\n\n"), vec!["A"]);
    }

    #[test]
    fn cr_is_part_of_the_line() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed(b"A\r\n"), vec!["A\r"]);
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed(b"one\ntwo\nthr"), vec!["one", "two"]);
        assert_eq!(buf.pending(), b"thr");
    }

    #[test]
    fn split_mid_utf8_is_tolerated() {
        let mut buf = LineBuffer::new();
        let bytes = "héllo\n".as_bytes();
        assert!(buf.feed(&bytes[..2]).is_empty());
        assert_eq!(buf.feed(&bytes[2..]), vec!["héllo"]);
    }
}

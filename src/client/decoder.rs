//! Incremental byte-to-line decoding.
//!
//! The feed arrives as arbitrarily chunked bytes; a chunk boundary can fall
//! anywhere, including between the bytes of a multi-byte character or in the
//! middle of a line. [`LineDecoder`] buffers at the byte level and only
//! converts to text once a complete line is in hand, so chunking never
//! changes what comes out.

use bytes::BytesMut;

/// Stateful decoder turning raw bytes into complete feed lines.
///
/// At most one partial trailing line is retained between calls; `feed`
/// yields every line completed by the new chunk and keeps the rest.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        LineDecoder {
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// Feed a chunk and collect the lines it completes.
    ///
    /// Line breaks are `\n`; the terminator is not part of the returned
    /// line. Heartbeats therefore come out as empty strings.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Take the buffered partial line, if any, for end-of-stream handling.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.feed(b"{\"seq\":1}\n{\"se"), vec!["{\"seq\":1}"]);
        assert_eq!(decoder.feed(b"q\":2}\n"), vec!["{\"seq\":2}"]);
        assert_eq!(decoder.flush(), None);
    }

    #[test]
    fn chunk_boundary_inside_multibyte_character() {
        let text = "{\"id\":\"caf\u{e9}\"}\n";
        let bytes = text.as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let split = bytes.len() - 4;

        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(&bytes[..split]).is_empty());
        let lines = decoder.feed(&bytes[split..]);
        assert_eq!(lines, vec!["{\"id\":\"caf\u{e9}\"}"]);
    }

    #[test]
    fn several_lines_in_one_chunk() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.feed(b"a\n\nb\n");
        assert_eq!(lines, vec!["a", "", "b"]);
    }

    #[test]
    fn flush_returns_the_partial_line_once() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"{\"seq\":3").is_empty());
        assert_eq!(decoder.flush().as_deref(), Some("{\"seq\":3"));
        assert_eq!(decoder.flush(), None);
    }

    #[test]
    fn chunking_invariance() {
        let input = b"{\"seq\":1,\"id\":\"a\"}\n\n{\"seq\":2,\"id\":\"b\"}\n";
        let whole = LineDecoder::new().feed(input);

        for split in 0..input.len() {
            let mut decoder = LineDecoder::new();
            let mut lines = decoder.feed(&input[..split]);
            lines.extend(decoder.feed(&input[split..]));
            assert_eq!(lines, whole, "split at {split}");
        }
    }
}

//! Stream framing for Electrum JSON documents.
//!
//! Servers terminate every document with `\n`, but a document is only
//! considered complete once its outermost `{`/`[` is balanced, so a server
//! that pretty-prints across lines still frames correctly:
//!
//! ```text
//! {"jsonrpc":"2.0","result":1,"id":1}\n[{"id":2,...},{"id":3,...}]\n
//! |<----------- frame 0 ------------->|  |<------- frame 1 ------->|
//! ```
//!
//! Delimiters inside string literals (including escaped quotes) never
//! affect the depth count. Input that does not start with `{` or `[` is
//! collected up to the next newline and yielded as-is so the caller can
//! report it as malformed.

use crate::error::ProtocolError;
use crate::MAX_DOCUMENT_SIZE;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// How document bodies are decoded into text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    /// Strict UTF-8; invalid bytes make the document malformed.
    #[default]
    Utf8,
    /// UTF-8 with invalid sequences replaced by U+FFFD.
    Utf8Lossy,
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(TextEncoding::Utf8),
            "utf8-lossy" | "lossy" => Ok(TextEncoding::Utf8Lossy),
            other => Err(format!("unsupported text encoding: {}", other)),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextEncoding::Utf8 => write!(f, "utf8"),
            TextEncoding::Utf8Lossy => write!(f, "utf8-lossy"),
        }
    }
}

/// A complete document body cut from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Position of this document in the stream, starting at 0.
    pub sequence: u64,
    /// Raw document bytes, without the trailing newline.
    pub body: Bytes,
}

impl Frame {
    /// Decodes the body into text.
    pub fn text(&self, encoding: TextEncoding) -> Result<Cow<'_, str>, ProtocolError> {
        match encoding {
            TextEncoding::Utf8 => std::str::from_utf8(&self.body)
                .map(Cow::Borrowed)
                .map_err(|_| ProtocolError::InvalidUtf8),
            TextEncoding::Utf8Lossy => Ok(String::from_utf8_lossy(&self.body)),
        }
    }

    /// Decodes and parses the body as a JSON value.
    pub fn parse(&self, encoding: TextEncoding) -> Result<Value, ProtocolError> {
        let text = self.text(encoding)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Skipping whitespace between documents.
    Between,
    /// Inside a `{...}` or `[...]` document.
    Structured,
    /// Inside a line that is not a JSON object or array.
    Bare,
}

/// Incremental splitter turning arbitrary chunks into complete documents.
pub struct Framer {
    buffer: BytesMut,
    /// Bytes of the current document already scanned.
    scanned: usize,
    mode: Mode,
    depth: usize,
    in_string: bool,
    escaped: bool,
    next_sequence: u64,
    max_document_size: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            scanned: 0,
            mode: Mode::Between,
            depth: 0,
            in_string: false,
            escaped: false,
            next_sequence: 0,
            max_document_size: MAX_DOCUMENT_SIZE,
        }
    }

    pub fn with_max_document_size(mut self, max: usize) -> Self {
        self.max_document_size = max;
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to cut the next complete document from the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed. An oversized partial
    /// document discards the whole buffer and returns an error.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        while self.scanned < self.buffer.len() {
            let byte = self.buffer[self.scanned];
            match self.mode {
                Mode::Between => {
                    if byte.is_ascii_whitespace() {
                        self.buffer.advance(1);
                        continue;
                    }
                    self.mode = if byte == b'{' || byte == b'[' {
                        Mode::Structured
                    } else {
                        Mode::Bare
                    };
                }
                Mode::Structured => {
                    self.scanned += 1;
                    if self.in_string {
                        if self.escaped {
                            self.escaped = false;
                        } else if byte == b'\\' {
                            self.escaped = true;
                        } else if byte == b'"' {
                            self.in_string = false;
                        }
                        continue;
                    }
                    match byte {
                        b'"' => self.in_string = true,
                        b'{' | b'[' => self.depth += 1,
                        b'}' | b']' => {
                            self.depth = self.depth.saturating_sub(1);
                            if self.depth == 0 {
                                let len = self.scanned;
                                return Ok(Some(self.take_frame(len)));
                            }
                        }
                        _ => {}
                    }
                }
                Mode::Bare => {
                    if byte == b'\n' {
                        let mut len = self.scanned;
                        if len > 0 && self.buffer[len - 1] == b'\r' {
                            len -= 1;
                        }
                        let frame = self.take_frame(len);
                        self.buffer.advance(1);
                        return Ok(Some(frame));
                    }
                    self.scanned += 1;
                }
            }
        }

        if self.buffer.len() > self.max_document_size {
            let size = self.buffer.len();
            self.clear();
            return Err(ProtocolError::DocumentTooLarge {
                size,
                max: self.max_document_size,
            });
        }

        Ok(None)
    }

    /// Returns an iterator draining every complete document buffered so far.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { framer: self }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the sequence number the next document will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Discards buffered data and resets the scanner. Sequence numbering continues.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.reset_scan();
    }

    fn take_frame(&mut self, len: usize) -> Frame {
        let consumed = self.scanned;
        let body = self.buffer.split_to(consumed).freeze().slice(..len);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.reset_scan();
        Frame { sequence, body }
    }

    fn reset_scan(&mut self) {
        self.scanned = 0;
        self.mode = Mode::Between;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy iterator over complete documents; see [`Framer::frames`].
pub struct Frames<'a> {
    framer: &'a mut Framer,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.decode_frame().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bodies(framer: &mut Framer) -> Vec<String> {
        framer
            .frames()
            .map(|f| String::from_utf8(f.unwrap().body.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_single_line() {
        let mut framer = Framer::new();
        framer.extend(b"{\"id\":1,\"result\":true}\n");
        assert_eq!(bodies(&mut framer), vec!["{\"id\":1,\"result\":true}"]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_multiple_documents_in_one_chunk() {
        let mut framer = Framer::new();
        framer.extend(b"{\"id\":1}\n[{\"id\":2},{\"id\":3}]\n{\"method\":\"m\",\"params\":[]}\n");
        assert_eq!(
            bodies(&mut framer),
            vec![
                "{\"id\":1}",
                "[{\"id\":2},{\"id\":3}]",
                "{\"method\":\"m\",\"params\":[]}"
            ]
        );
    }

    #[test]
    fn test_document_split_across_chunks() {
        let mut framer = Framer::new();
        framer.extend(b"{\"id\":1,\"res");
        assert!(framer.decode_frame().unwrap().is_none());
        framer.extend(b"ult\":[1,2");
        assert!(framer.decode_frame().unwrap().is_none());
        framer.extend(b"]}\n{\"id\"");
        let frame = framer.decode_frame().unwrap().unwrap();
        assert_eq!(&frame.body[..], b"{\"id\":1,\"result\":[1,2]}");
        assert!(framer.decode_frame().unwrap().is_none());
        framer.extend(b":2}\n");
        let frame = framer.decode_frame().unwrap().unwrap();
        assert_eq!(&frame.body[..], b"{\"id\":2}");
    }

    #[test]
    fn test_delimiters_inside_strings() {
        let mut framer = Framer::new();
        framer.extend(b"{\"result\":\"}{][\\n\",\"id\":1}\n");
        assert_eq!(
            bodies(&mut framer),
            vec!["{\"result\":\"}{][\\n\",\"id\":1}"]
        );
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let mut framer = Framer::new();
        framer.extend(b"{\"result\":\"a\\\"}b\\\\\",\"id\":7}\n");
        let frame = framer.decode_frame().unwrap().unwrap();
        let value = frame.parse(TextEncoding::Utf8).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["result"], "a\"}b\\");
    }

    #[test]
    fn test_document_spanning_newlines() {
        let mut framer = Framer::new();
        framer.extend(b"{\n  \"id\": 1,\n  \"result\": null\n}\n");
        let frame = framer.decode_frame().unwrap().unwrap();
        let value = frame.parse(TextEncoding::Utf8).unwrap();
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut framer = Framer::new();
        framer.extend(b"{\"a\":1}\n{\"a\":2}\n");
        let seqs: Vec<u64> = framer.frames().map(|f| f.unwrap().sequence).collect();
        assert_eq!(seqs, vec![0, 1]);

        framer.extend(b"{\"a\":3}\n");
        assert_eq!(framer.decode_frame().unwrap().unwrap().sequence, 2);
        assert_eq!(framer.next_sequence(), 3);
    }

    #[test]
    fn test_bare_line_is_yielded_for_reporting() {
        let mut framer = Framer::new();
        framer.extend(b"garbage here\r\n{\"id\":1}\n");
        let frames: Vec<Frame> = framer.frames().map(|f| f.unwrap()).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].body[..], b"garbage here");
        assert!(frames[0].parse(TextEncoding::Utf8).is_err());
        assert_eq!(&frames[1].body[..], b"{\"id\":1}");
    }

    #[test]
    fn test_oversized_document_discards_buffer() {
        let mut framer = Framer::new().with_max_document_size(16);
        framer.extend(b"{\"result\":\"aaaaaaaaaaaaaaaaaaaa");
        let err = framer.decode_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::DocumentTooLarge { .. }));
        assert_eq!(framer.buffered(), 0);

        framer.extend(b"{\"id\":1}\n");
        assert_eq!(&framer.decode_frame().unwrap().unwrap().body[..], b"{\"id\":1}");
    }

    #[test]
    fn test_invalid_utf8_strict_and_lossy() {
        let frame = Frame {
            sequence: 0,
            body: Bytes::from_static(b"{\"result\":\"\xff\"}"),
        };
        assert!(matches!(
            frame.text(TextEncoding::Utf8),
            Err(ProtocolError::InvalidUtf8)
        ));
        let value = frame.parse(TextEncoding::Utf8Lossy).unwrap();
        assert_eq!(value["result"], "\u{FFFD}");
    }

    #[test]
    fn test_text_encoding_parse() {
        assert_eq!("UTF-8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!(
            "lossy".parse::<TextEncoding>().unwrap(),
            TextEncoding::Utf8Lossy
        );
        assert!("latin1".parse::<TextEncoding>().is_err());
    }

    const STREAM: &[u8] = b"{\"jsonrpc\":\"2.0\",\"result\":\"}\\\"{\",\"id\":1}\n\
[{\"id\":2,\"result\":[1,[2]]},{\"id\":3,\"error\":{\"code\":-1,\"message\":\"]\"}}]\n\
{\"method\":\"blockchain.headers.subscribe\",\"params\":[{\"height\":5}]}\n";

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_change_frames(
            mut cuts in proptest::collection::vec(0..STREAM.len(), 0..12)
        ) {
            let mut whole = Framer::new();
            whole.extend(STREAM);
            let expected = bodies(&mut whole);

            cuts.sort_unstable();
            let mut framer = Framer::new();
            let mut got = Vec::new();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(STREAM.len())) {
                framer.extend(&STREAM[start..cut]);
                got.extend(bodies(&mut framer));
                start = cut;
            }

            prop_assert_eq!(got, expected);
            prop_assert_eq!(framer.buffered(), 0);
        }
    }
}

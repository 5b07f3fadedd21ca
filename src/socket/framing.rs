//! Null-terminated message framing for the XMLSocket protocol.
//!
//! Every message on the wire is the single-byte encoding of its text
//! followed by exactly one `0x00`. There is no length prefix and no escaping,
//! so a message can never contain the delimiter itself.
//!
//! # Wire Format
//!
//! ```text
//! <message-bytes>\0<message-bytes>\0...
//! ```
//!
//! Reads from a stream socket split at arbitrary offsets, so incoming bytes go
//! through a [`FrameDecoder`] which keeps the unterminated tail between reads.

use super::client::XmlSocketError;

/// Message delimiter byte.
pub const DELIMITER: u8 = 0;

/// Byte substituted for characters that have no ASCII encoding.
const REPLACEMENT: u8 = b'?';

/// Encode a message as an XMLSocket frame (ASCII bytes plus the trailing `\0`).
///
/// Non-ASCII characters are replaced with `?`. A `\0` inside `message` is
/// written as-is and will split the message on the receiving side.
///
/// # Example
///
/// ```
/// use xmlsocket::encode_frame;
///
/// assert_eq!(encode_frame("<ping/>"), b"<ping/>\0");
/// ```
pub fn encode_frame(message: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(message.len() + 1);
    frame.extend(
        message
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { REPLACEMENT }),
    );
    frame.push(DELIMITER);
    frame
}

/// Reassembles delimited messages from arbitrarily chunked input.
///
/// The accumulator always holds exactly the bytes seen since the last
/// delimiter. Completed messages are handed out by value; the buffer itself is
/// never exposed.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Unterminated prefix of the next message.
    pending: String,
    /// Wire bytes held in `pending`.
    pending_len: usize,
    /// Upper bound on a single message, in bytes received.
    max_len: Option<usize>,
}

impl FrameDecoder {
    /// Create a decoder that rejects messages longer than `max_len` bytes.
    pub fn with_max_len(max_len: Option<usize>) -> Self {
        Self {
            pending: String::new(),
            pending_len: 0,
            max_len,
        }
    }

    /// Feed one chunk of received bytes.
    ///
    /// `on_message` is called once per delimiter, in stream order, with the
    /// completed message (possibly empty). Bytes after the last delimiter stay
    /// buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns `XmlSocketError::MessageTooLarge` once the buffered message
    /// grows past the configured limit. Messages completed earlier in the same
    /// chunk have already been delivered.
    pub fn decode<F>(
        &mut self,
        chunk: &[u8],
        mut on_message: F,
    ) -> Result<(), XmlSocketError>
    where
        F: FnMut(String),
    {
        for &byte in chunk {
            if byte == DELIMITER {
                self.pending_len = 0;
                on_message(std::mem::take(&mut self.pending));
                continue;
            }

            if let Some(limit) = self.max_len {
                if self.pending_len >= limit {
                    return Err(XmlSocketError::MessageTooLarge { limit });
                }
            }

            // Single-byte decoding: 0x00..=0xFF maps onto U+0000..=U+00FF
            self.pending.push(char::from(byte));
            self.pending_len += 1;
        }

        Ok(())
    }

    /// Number of bytes buffered for the not-yet-terminated message.
    pub fn pending_len(&self) -> usize {
        self.pending_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(decoder: &mut FrameDecoder, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        decoder
            .decode(chunk, |msg| out.push(msg))
            .expect("decode failed");
        out
    }

    #[test]
    fn test_encode_appends_delimiter() {
        assert_eq!(encode_frame("<a/>"), b"<a/>\0".to_vec());
        assert_eq!(encode_frame(""), vec![0u8]);
    }

    #[test]
    fn test_encode_replaces_non_ascii() {
        assert_eq!(encode_frame("caf\u{e9}"), b"caf?\0".to_vec());
        assert_eq!(encode_frame("\u{3042}x"), b"?x\0".to_vec());
    }

    #[test]
    fn test_encode_passes_embedded_null_through() {
        assert_eq!(encode_frame("a\0b"), b"a\0b\0".to_vec());
    }

    #[test]
    fn test_multiple_messages_in_one_chunk() {
        let mut decoder = FrameDecoder::default();
        let messages = decode_all(&mut decoder, b"a\0b\0c\0");

        assert_eq!(messages, vec!["a", "b", "c"]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_message_split_across_reads() {
        let mut decoder = FrameDecoder::default();

        assert!(decode_all(&mut decoder, b"ab").is_empty());
        assert_eq!(decoder.pending_len(), 2);

        assert_eq!(decode_all(&mut decoder, b"c\0"), vec!["abc"]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_empty_messages_are_delivered() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decode_all(&mut decoder, b"\0"), vec![""]);
        assert_eq!(decode_all(&mut decoder, b"x\0\0"), vec!["x", ""]);
    }

    #[test]
    fn test_trailing_partial_is_retained() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decode_all(&mut decoder, b"one\0tw"), vec!["one"]);
        assert_eq!(decoder.pending_len(), 2);
        assert_eq!(decode_all(&mut decoder, b"o\0"), vec!["two"]);
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let stream = b"<msg id=\"1\"/>\0\0<msg>hello</msg>\0tail";
        let mut whole = FrameDecoder::default();
        let expected = decode_all(&mut whole, stream);
        assert_eq!(expected, vec!["<msg id=\"1\"/>", "", "<msg>hello</msg>"]);

        // One byte at a time
        let mut bytewise = FrameDecoder::default();
        let mut got = Vec::new();
        for byte in stream.iter() {
            got.extend(decode_all(&mut bytewise, std::slice::from_ref(byte)));
        }
        assert_eq!(got, expected);
        assert_eq!(bytewise.pending_len(), 4);

        // Every two-way split
        for split in 0..=stream.len() {
            let mut decoder = FrameDecoder::default();
            let mut got = decode_all(&mut decoder, &stream[..split]);
            got.extend(decode_all(&mut decoder, &stream[split..]));
            assert_eq!(got, expected, "split at offset {}", split);
        }
    }

    #[test]
    fn test_high_bytes_decode_one_to_one() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decode_all(&mut decoder, &[0x41, 0xE9, 0x00]), vec!["A\u{e9}"]);
    }

    #[test]
    fn test_max_len_rejects_oversized_message() {
        let mut decoder = FrameDecoder::with_max_len(Some(4));
        let mut out = Vec::new();

        let result = decoder.decode(b"abcd\0abcde", |msg| out.push(msg));

        assert_eq!(out, vec!["abcd"]);
        match result {
            Err(XmlSocketError::MessageTooLarge { limit }) => assert_eq!(limit, 4),
            other => panic!("Expected MessageTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_max_len_applies_across_chunks() {
        let mut decoder = FrameDecoder::with_max_len(Some(3));
        assert!(decoder.decode(b"ab", |_| {}).is_ok());
        assert!(decoder.decode(b"c", |_| {}).is_ok());
        assert!(decoder.decode(b"d", |_| {}).is_err());
    }
}

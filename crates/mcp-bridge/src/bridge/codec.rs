//! Newline-delimited JSON codec for the child's stdio.
//!
//! Uses LinesCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, in-memory duplex, etc).
//!
//! Decoding is lenient: the child's stdout is not trusted to be well formed,
//! so lines that are not valid JSON (or not UTF-8, or too long) are logged and
//! skipped instead of terminating the stream.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Longest line accepted from the child before it is discarded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

const PREVIEW_CHARS: usize = 200;

/// Codec that frames one JSON document per `\n`-terminated line.
pub struct NdjsonCodec<T> {
    inner: LinesCodec,
    max_line_bytes: usize,
    dropped_lines: u64,
    _phantom: PhantomData<T>,
}

impl<T> Default for NdjsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NdjsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
            dropped_lines: 0,
            _phantom: PhantomData,
        }
    }

    /// Number of lines skipped because they could not be decoded.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    fn reset(&mut self) {
        self.inner = LinesCodec::new_with_max_length(self.max_line_bytes);
    }
}

impl<T: DeserializeOwned> NdjsonCodec<T> {
    /// Append `chunk` to `buf` and return every complete message it yields.
    ///
    /// Bytes after the last newline stay in `buf` for the next call.
    pub fn feed(&mut self, buf: &mut BytesMut, chunk: &[u8]) -> io::Result<Vec<T>> {
        buf.extend_from_slice(chunk);
        let mut items = Vec::new();
        while let Some(item) = self.decode(buf)? {
            items.push(item);
        }
        Ok(items)
    }
}

fn preview(line: &str) -> String {
    if line.chars().count() <= PREVIEW_CHARS {
        line.to_string()
    } else {
        let head: String = line.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}

impl<T: DeserializeOwned> Decoder for NdjsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<T>(trimmed) {
                        Ok(item) => return Ok(Some(item)),
                        Err(e) => {
                            self.dropped_lines += 1;
                            tracing::warn!(
                                error = %e,
                                line = %preview(trimmed),
                                dropped_total = self.dropped_lines,
                                "Dropping malformed line from child"
                            );
                        }
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    self.dropped_lines += 1;
                    tracing::warn!(
                        max_line_bytes = self.max_line_bytes,
                        dropped_total = self.dropped_lines,
                        "Dropping over-long line from child"
                    );
                }
                // LinesCodec has already consumed the offending line.
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    self.dropped_lines += 1;
                    tracing::warn!(
                        error = %e,
                        dropped_total = self.dropped_lines,
                        "Dropping non-UTF-8 line from child"
                    );
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        // An unterminated tail from a dead process is never parsed.
        if !src.is_empty() {
            tracing::debug!(bytes = src.len(), "Discarding partial frame at end of stream");
            src.clear();
            self.reset();
        }
        Ok(None)
    }
}

impl<T, I: Serialize> Encoder<I> for NdjsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: I, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{RequestId, RpcRequest};
    use serde_json::{Value, json};

    #[test]
    fn encode_appends_single_newline() {
        let mut codec = NdjsonCodec::<Value>::new();
        let mut buf = BytesMut::new();

        let req = RpcRequest::new(RequestId::Number(1), "tools/list", None);
        codec.encode(req, &mut buf).unwrap();

        assert_eq!(
            &buf[..],
            &b"{\"jsonrpc\":\"2.0\",\"method\":\"tools/list\",\"id\":1}\n"[..]
        );
    }

    #[test]
    fn embedded_newlines_are_escaped() {
        let mut codec = NdjsonCodec::<Value>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(json!({"text": "line one\nline two"}), &mut buf)
            .unwrap();

        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded["text"], "line one\nline two");
    }

    #[test]
    fn decode_waits_for_terminator() {
        let mut codec = NdjsonCodec::<Value>::new();
        let mut buf = BytesMut::new();

        let first = codec.feed(&mut buf, br#"{"id":1,"res"#).unwrap();
        assert!(first.is_empty());

        let second = codec.feed(&mut buf, b"ult\":true}\n{\"id\":2").unwrap();
        assert_eq!(second, vec![json!({"id": 1, "result": true})]);

        let third = codec.feed(&mut buf, b",\"result\":false}\n").unwrap();
        assert_eq!(third, vec![json!({"id": 2, "result": false})]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_skips_blank_and_malformed_lines() {
        let mut codec = NdjsonCodec::<Value>::new();
        let mut buf = BytesMut::new();

        let items = codec
            .feed(
                &mut buf,
                b"\n   \nnot json at all\n{\"id\":1,\"result\":{}}\r\n{broken\n{\"id\":2,\"result\":{}}\n",
            )
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], 1);
        assert_eq!(items[1]["id"], 2);
        assert_eq!(codec.dropped_lines(), 2);
    }

    #[test]
    fn decode_skips_invalid_utf8() {
        let mut codec = NdjsonCodec::<Value>::new();
        let mut buf = BytesMut::new();

        let items = codec
            .feed(&mut buf, b"\xff\xfe\xfd\n{\"id\":9,\"result\":null}\n")
            .unwrap();

        assert_eq!(items, vec![json!({"id": 9, "result": null})]);
        assert_eq!(codec.dropped_lines(), 1);
    }

    #[test]
    fn decode_discards_overlong_lines_and_resyncs() {
        let mut codec = NdjsonCodec::<Value>::with_max_line_bytes(16);
        let mut buf = BytesMut::new();

        let items = codec
            .feed(&mut buf, b"{\"padding\":\"xxxxxxxxxxxxxxxxxxxxxxxx\"}\n{\"id\":1}\n")
            .unwrap();

        assert_eq!(items, vec![json!({"id": 1})]);
        assert_eq!(codec.dropped_lines(), 1);
    }

    #[test]
    fn decode_eof_discards_partial_frame() {
        let mut codec = NdjsonCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"{\"id\":1,\"result\":{}}\n{\"id\":2,\"res"[..]);

        let first = codec.decode_eof(&mut buf).unwrap();
        assert_eq!(first, Some(json!({"id": 1, "result": {}})));

        let second = codec.decode_eof(&mut buf).unwrap();
        assert_eq!(second, None);
        assert!(buf.is_empty());
    }

    #[test]
    fn typed_decode_rejects_wrong_shape_without_error() {
        let mut codec = NdjsonCodec::<RpcRequest>::new();
        let mut buf = BytesMut::new();

        let items = codec
            .feed(
                &mut buf,
                b"{\"unexpected\":true}\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":3}\n",
            )
            .unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].method, "ping");
        assert_eq!(items[0].id, Some(RequestId::Number(3)));
    }
}

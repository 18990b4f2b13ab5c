//! Server-sent events framing.
//!
//! Lines come from [`SseLineCodec`], which splits raw bytes on `\n` and strips a
//! trailing `\r`; the decoder accumulates fields until a blank line dispatches the frame.
//! A line that is not UTF-8 or exceeds the length limit poisons only the frame it
//! belongs to.

use bytes::{Buf, BytesMut};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

use crate::constants::{MAX_SSE_FRAME_BYTES, MAX_SSE_LINE_BYTES};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
    /// Set when the frame could not be decoded; `data` is empty then.
    pub invalid: Option<String>,
}

impl SseFrame {
    pub fn event_name(&self) -> &str {
        self.event
            .as_deref()
            .unwrap_or(crate::constants::EVENT_MESSAGE)
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data_lines: Vec<String>,
    data_bytes: usize,
    id: Option<String>,
    retry_ms: Option<u64>,
    invalid: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the pending frame as undecodable. The frame still dispatches at the next
    /// blank line so the caller can report it.
    pub fn push_invalid(&mut self, reason: impl Into<String>) {
        if self.invalid.is_none() {
            self.invalid = Some(reason.into());
        }
    }

    /// Feeds one line; returns a frame when the line completes one.
    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_bytes += value.len();
                if self.data_bytes > MAX_SSE_FRAME_BYTES {
                    self.data_lines.clear();
                    self.push_invalid(format!("data exceeds {} bytes", MAX_SSE_FRAME_BYTES));
                } else if self.invalid.is_none() {
                    self.data_lines.push(value.to_string());
                }
            }
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry_ms = Some(ms);
                }
            }
            other => {
                tracing::trace!("[SSE] Ignoring unknown field: {}", other);
            }
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let data_lines = std::mem::take(&mut self.data_lines);
        let invalid = self.invalid.take();
        let retry_ms = self.retry_ms.take();
        self.data_bytes = 0;

        if let Some(reason) = invalid {
            tracing::debug!("[SSE] Frame {:?} is undecodable: {}", event, reason);
            return Some(SseFrame {
                event,
                data: String::new(),
                id: self.id.clone(),
                retry_ms,
                invalid: Some(reason),
            });
        }
        // Named events may legitimately carry no body (heartbeats).
        if data_lines.is_empty() && event.is_none() {
            return None;
        }

        Some(SseFrame {
            event,
            data: data_lines.join("\n"),
            id: self.id.clone(),
            retry_ms,
            invalid: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Text(String),
    Invalid(String),
}

/// Splits a byte stream on `\n`. Unlike `LinesCodec` it never fails on content:
/// non-UTF-8 and over-long lines come out as [`SseLine::Invalid`] and decoding
/// carries on with the next line.
#[derive(Debug)]
pub struct SseLineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl SseLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn line(&self, mut raw: BytesMut) -> SseLine {
        if raw.last() == Some(&b'\r') {
            raw.truncate(raw.len() - 1);
        }
        match String::from_utf8(raw.to_vec()) {
            Ok(text) => SseLine::Text(text),
            Err(e) => SseLine::Invalid(format!("invalid UTF-8 in stream: {}", e.utf8_error())),
        }
    }
}

impl Decoder for SseLineCodec {
    type Item = SseLine;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<SseLine>> {
        loop {
            let read_to = std::cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to].iter().position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(SseLine::Invalid(format!(
                        "line exceeds {} bytes",
                        self.max_length
                    ))));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut raw = buf.split_to(end + 1);
                    raw.truncate(end);
                    return Ok(Some(self.line(raw)));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<SseLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding || buf.is_empty() {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }
        let raw = buf.split_to(buf.len());
        Ok(Some(self.line(raw)))
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = std::io::Result<SseFrame>> + Send>>;

/// Decodes an SSE byte source into frames. Ends when the source ends; an incomplete
/// trailing frame is discarded.
pub fn frame_stream<R>(reader: R) -> FrameStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    frame_stream_with_limit(reader, MAX_SSE_LINE_BYTES)
}

pub(crate) fn frame_stream_with_limit<R>(reader: R, max_line_bytes: usize) -> FrameStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let lines = FramedRead::new(reader, SseLineCodec::new(max_line_bytes));
    let stream = futures_util::stream::unfold(
        (lines, SseDecoder::new()),
        |(mut lines, mut decoder)| async move {
            loop {
                match lines.next().await {
                    Some(Ok(SseLine::Text(line))) => {
                        if let Some(frame) = decoder.push_line(&line) {
                            return Some((Ok(frame), (lines, decoder)));
                        }
                    }
                    Some(Ok(SseLine::Invalid(reason))) => {
                        tracing::warn!("[SSE] Undecodable line: {}", reason);
                        decoder.push_invalid(reason);
                    }
                    Some(Err(e)) => return Some((Err(e), (lines, decoder))),
                    None => return None,
                }
            }
        },
    );
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<SseFrame> {
        let mut decoder = SseDecoder::new();
        input
            .split('\n')
            .filter_map(|line| decoder.push_line(line))
            .collect()
    }

    #[test]
    fn test_named_event_with_json_body() {
        let frames = decode_all("event: progress\ndata: {\"pct\":40}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_name(), "progress");
        assert_eq!(frames[0].data, "{\"pct\":40}");
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let frames = decode_all("data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_name(), "message");
        assert_eq!(frames[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn test_comments_and_blank_runs_produce_nothing() {
        let frames = decode_all(": keepalive\n\n\n: another\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn test_heartbeat_without_data_still_dispatches() {
        let frames = decode_all("event: heartbeat\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_name(), "heartbeat");
        assert!(frames[0].data.is_empty());
    }

    #[test]
    fn test_id_persists_and_retry_is_per_frame() {
        let frames = decode_all("id: 7\nretry: 1500\ndata: {}\n\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(frames[0].retry_ms, Some(1500));
        assert_eq!(frames[1].id.as_deref(), Some("7"));
        assert_eq!(frames[1].retry_ms, None);
    }

    #[test]
    fn test_field_without_space_after_colon() {
        let frames = decode_all("event:ready\ndata:{\"pages\":3}\n\n");
        assert_eq!(frames[0].event_name(), "ready");
        assert_eq!(frames[0].data, "{\"pages\":3}");
    }

    #[tokio::test]
    async fn test_frame_stream_over_reader() {
        let body = "event: meta\r\ndata: {\"pct\":5}\r\n\r\nevent: ready\ndata: {}\n\nevent: progress\ndata: {\"pct\":1}";
        let mut frames = frame_stream(std::io::Cursor::new(body.as_bytes().to_vec()));

        let mut names = Vec::new();
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(f) => names.push(f.event_name().to_string()),
                Err(e) => panic!("Unexpected error: {}", e),
            }
        }
        assert_eq!(names, vec!["meta", "ready"]);
    }

    async fn collect(stream: FrameStream) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        let mut stream = stream;
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(f) => frames.push(f),
                Err(e) => panic!("Unexpected error: {}", e),
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_invalid_utf8_poisons_only_its_frame() {
        let mut body = b"event: progress\ndata: {\"pct\":10,\"x\":\"".to_vec();
        body.extend_from_slice(&[0xff, 0xfe]);
        body.extend_from_slice(b"\"}\nid: 4\n\nevent: progress\ndata: {\"pct\":20}\n\n");

        let frames = collect(frame_stream(std::io::Cursor::new(body))).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event_name(), "progress");
        assert!(frames[0].invalid.as_deref().unwrap().contains("UTF-8"));
        assert!(frames[0].data.is_empty());
        assert_eq!(frames[0].id.as_deref(), Some("4"));
        assert_eq!(frames[1].invalid, None);
        assert_eq!(frames[1].data, "{\"pct\":20}");
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped_and_decoding_resumes() {
        let long = "x".repeat(64);
        let body = format!(
            "event: meta\ndata: {}\n\nevent: progress\ndata: {{\"pct\":30}}\n\n",
            long
        );

        let frames = collect(frame_stream_with_limit(std::io::Cursor::new(body.into_bytes()), 32)).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event_name(), "meta");
        assert!(frames[0].invalid.as_deref().unwrap().contains("32 bytes"));
        assert_eq!(frames[1].event_name(), "progress");
        assert_eq!(frames[1].data, "{\"pct\":30}");
    }

    #[test]
    fn test_line_codec_splits_across_partial_reads() {
        let mut codec = SseLineCodec::new(1024);
        let mut buf = BytesMut::from(&b"data: ab"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"c\r\n\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(SseLine::Text("data: abc".into())));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(SseLine::Text(String::new())));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}

//! Line-oriented decoder for the server-sent-event payloads the providers emit.
//!
//! Every provider reply that streams goes through [`decode`], which turns a raw
//! byte stream into plain text fragments. Four frame shapes are recognized, in
//! priority order:
//!
//! 1. `{"chunk": "..."}` (router-style)
//! 2. `{"type": "content_block_delta", "delta": {"type": "text_delta", "text": "..."}}` (Anthropic)
//! 3. `{"choices": [{"delta": {"content": "..."}}]}` (OpenAI)
//! 4. `{"choices": [{"message": {"content": "..."}}]}` (non-streamed payload sent as a frame)
//!
//! Keep-alives, `[DONE]`, `event:` lines and unparseable payloads are skipped.
//! A read error ends the stream quietly; whatever was decoded before it stands.

use std::collections::VecDeque;

use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;

use crate::types::ByteStream;

/// A decoded data frame, discriminated by which known field is present.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Chunk(String),
    ContentBlockDelta(String),
    ChoiceDelta(String),
    ChoiceMessage(String),
    Other,
}

impl Frame {
    pub fn from_value(data: &Value) -> Frame {
        if let Some(chunk) = data.get("chunk").and_then(Value::as_str) {
            return Frame::Chunk(chunk.to_string());
        }
        if data["type"] == "content_block_delta" && data["delta"]["type"] == "text_delta" {
            if let Some(text) = data["delta"]["text"].as_str() {
                return Frame::ContentBlockDelta(text.to_string());
            }
        }
        let choice = &data["choices"][0];
        if let Some(content) = choice["delta"]["content"].as_str().filter(|c| !c.is_empty()) {
            return Frame::ChoiceDelta(content.to_string());
        }
        if let Some(content) = choice["message"]["content"]
            .as_str()
            .filter(|c| !c.is_empty())
        {
            return Frame::ChoiceMessage(content.to_string());
        }
        Frame::Other
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Frame::Chunk(s)
            | Frame::ContentBlockDelta(s)
            | Frame::ChoiceDelta(s)
            | Frame::ChoiceMessage(s) => Some(s),
            Frame::Other => None,
        }
    }
}

/// Classify one complete line. `None` means the line carries no text.
pub fn parse_line(line: &str) -> Option<Frame> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return None;
    }
    let payload = line.strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim();
    if payload.is_empty() || payload == "[DONE]" || payload == "ping" {
        return None;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(data) => Some(Frame::from_value(&data)),
        Err(e) => {
            tracing::debug!(error = %e, line = payload, "skipping malformed stream frame");
            None
        }
    }
}

struct DecodeState {
    source: Option<ByteStream>,
    buffer: Vec<u8>,
    ready: VecDeque<String>,
}

impl DecodeState {
    fn push_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        if let Some(text) = parse_line(&line).and_then(Frame::into_text) {
            if !text.is_empty() {
                self.ready.push_back(text);
            }
        }
    }

    fn drain_complete_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.push_line(&line[..line.len() - 1]);
        }
    }

    fn finish(&mut self) {
        self.source = None;
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.push_line(&tail);
        }
    }
}

/// Decode a provider byte stream into text fragments, in arrival order.
///
/// The returned stream is finite and single-use. The source stream is dropped
/// as soon as it is exhausted or fails.
pub fn decode(source: ByteStream) -> BoxStream<'static, String> {
    let state = DecodeState {
        source: Some(source),
        buffer: Vec::new(),
        ready: VecDeque::new(),
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.ready.pop_front() {
                return Some((fragment, state));
            }
            let source = state.source.as_mut()?;
            match source.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    state.drain_complete_lines();
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "stream read failed, ending response early");
                    state.source = None;
                    state.buffer.clear();
                }
                None => state.finish(),
            }
        }
    });

    Box::pin(stream)
}

/// Buffer-then-emit variant: the whole decoded text, returned once the
/// source is exhausted.
pub async fn collect_text(source: ByteStream) -> String {
    decode(source).collect::<Vec<_>>().await.concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn byte_stream(parts: Vec<&[u8]>) -> ByteStream {
        let owned: Vec<anyhow::Result<Bytes>> = parts
            .into_iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        Box::pin(futures::stream::iter(owned))
    }

    #[tokio::test]
    async fn chunk_frames_concatenate() {
        let stream = byte_stream(vec![
            b"data: {\"chunk\":\"Hel\"}\n",
            b"data: {\"chunk\":\"lo\"}\n",
            b"data: [DONE]\n",
        ]);
        assert_eq!(collect_text(stream).await, "Hello");
    }

    #[tokio::test]
    async fn all_four_shapes_in_arrival_order() {
        let stream = byte_stream(vec![
            b"data: {\"chunk\":\"a\"}\n\n",
            b"event: content_block_delta\n",
            b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"b\"}}\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"c\"}}]}\n\n",
            b"data: {\"choices\":[{\"message\":{\"content\":\"d\"}}]}\n\n",
        ]);
        let fragments: Vec<String> = decode(stream).collect().await;
        assert_eq!(fragments, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn lines_split_across_reads_are_reassembled() {
        let stream = byte_stream(vec![
            b"data: {\"choices\":[{\"del",
            b"ta\":{\"content\":\"Hi\"}}]}\ndata: {\"chu",
            b"nk\":\" there\"}\n",
        ]);
        assert_eq!(collect_text(stream).await, "Hi there");
    }

    #[tokio::test]
    async fn multibyte_characters_split_across_reads() {
        let text = "data: {\"chunk\":\"Привет\"}\n".as_bytes();
        // Byte 17 sits inside the two-byte encoding of the first letter.
        let (head, tail) = text.split_at(17);
        assert_eq!(collect_text(byte_stream(vec![head, tail])).await, "Привет");
    }

    #[tokio::test]
    async fn malformed_and_control_lines_are_skipped() {
        let stream = byte_stream(vec![
            b"event: ping\n",
            b"data: {\"type\": \"ping\"}\n",
            b": keep-alive\n",
            b"data: {not json}\n",
            b"data:{\"chunk\":\"ok\"}\r\n",
            b"id: 7\n",
            b"data: \n",
        ]);
        assert_eq!(collect_text(stream).await, "ok");
    }

    #[tokio::test]
    async fn unterminated_final_line_is_processed() {
        let stream = byte_stream(vec![b"data: {\"chunk\":\"a\"}\ndata: {\"chunk\":\"b\"}"]);
        assert_eq!(collect_text(stream).await, "ab");
    }

    #[tokio::test]
    async fn read_error_keeps_earlier_fragments() {
        let parts: Vec<anyhow::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"chunk\":\"Hel\"}\n")),
            Err(anyhow::anyhow!("connection reset")),
            Ok(Bytes::from_static(b"data: {\"chunk\":\"lo\"}\n")),
        ];
        let stream: ByteStream = Box::pin(futures::stream::iter(parts));
        assert_eq!(collect_text(stream).await, "Hel");
    }

    #[test]
    fn chunk_field_wins_over_choices() {
        let data = serde_json::json!({
            "chunk": "router",
            "choices": [{"delta": {"content": "openai"}}]
        });
        assert_eq!(Frame::from_value(&data), Frame::Chunk("router".into()));
    }

    #[test]
    fn anthropic_non_text_delta_is_other() {
        let data = serde_json::json!({
            "type": "content_block_delta",
            "delta": {"type": "input_json_delta", "partial_json": "{"}
        });
        assert_eq!(Frame::from_value(&data), Frame::Other);
        assert_eq!(parse_line("data: {\"type\":\"message_stop\"}"), Some(Frame::Other));
    }
}

//! Stream bridge: upstream SSE bytes -> decoded fragments -> [`ChunkCollector`].
//!
//! Network chunks do not respect line boundaries, so bytes are re-split into
//! lines by [`LineBuffer`] before each line is classified. Only `data:` lines
//! carry payload; `data: [DONE]` terminates the stream and everything else
//! (comments, `event:` lines, blank separators) is ignored. A payload that is
//! not valid fragment JSON is dropped and folding continues.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::models::chat::ChatCompletionChunk;
use crate::proxy::stream::ChunkCollector;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, PartialEq, Eq)]
pub enum SseLine<'a> {
    /// Payload of a `data:` line, trimmed.
    Data(&'a str),
    /// The terminal `data: [DONE]` marker.
    Done,
    /// Anything without payload.
    Other,
}

/// Classifies one line (without its terminator). Accepts `data:` with or
/// without a following space.
pub fn classify_line(line: &str) -> SseLine<'_> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Other;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        SseLine::Done
    } else if payload.is_empty() {
        SseLine::Other
    } else {
        SseLine::Data(payload)
    }
}

/// Reassembles complete lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no `\n`.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them, with `\n`
    /// and any trailing `\r` removed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
            from = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();
        lines
    }

    /// The trailing unterminated line, if any.
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(decode_line(&self.pending))
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// What happened while folding a stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FoldSummary {
    pub fragments: u32,
    pub skipped: u32,
    /// False when upstream closed without sending `[DONE]`.
    pub saw_done: bool,
}

/// Feeds every fragment of `stream` into `collector`. Stops reading at
/// `[DONE]`; the caller dropping the stream afterwards releases the upstream
/// connection. Transport errors end folding and are returned as-is.
pub async fn fold_sse_stream<S, E>(
    mut stream: S,
    collector: &mut ChunkCollector,
) -> Result<FoldSummary, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut lines = LineBuffer::new();
    let mut summary = FoldSummary::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in lines.push(&chunk) {
            if feed_line(&line, collector, &mut summary) {
                summary.saw_done = true;
                return Ok(summary);
            }
        }
    }

    if let Some(line) = lines.finish() {
        if feed_line(&line, collector, &mut summary) {
            summary.saw_done = true;
        }
    }
    Ok(summary)
}

/// Returns true on the terminal marker.
fn feed_line(line: &str, collector: &mut ChunkCollector, summary: &mut FoldSummary) -> bool {
    match classify_line(line) {
        SseLine::Done => true,
        SseLine::Other => false,
        SseLine::Data(payload) => {
            match serde_json::from_str::<ChatCompletionChunk>(payload) {
                Ok(fragment) => {
                    summary.fragments += 1;
                    collector.add_chunk(fragment);
                }
                Err(e) => {
                    summary.skipped += 1;
                    tracing::debug!(error = %e, "skipping malformed stream fragment");
                }
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn byte_stream(parts: Vec<&'static str>) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))))
    }

    // ── Line classification ─────────────────────────────────────

    #[test]
    fn test_classify_line() {
        assert_eq!(classify_line(r#"data: {"a":1}"#), SseLine::Data(r#"{"a":1}"#));
        assert_eq!(classify_line(r#"data:{"a":1}"#), SseLine::Data(r#"{"a":1}"#));
        assert_eq!(classify_line("data: [DONE]"), SseLine::Done);
        assert_eq!(classify_line("data:[DONE]"), SseLine::Done);
        assert_eq!(classify_line(""), SseLine::Other);
        assert_eq!(classify_line(": keep-alive"), SseLine::Other);
        assert_eq!(classify_line("event: message"), SseLine::Other);
        assert_eq!(classify_line("data: "), SseLine::Other);
    }

    // ── Line buffer ─────────────────────────────────────────────

    #[test]
    fn test_line_split_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"id\"").is_empty());
        assert_eq!(buf.push(b":\"x\"}\r\ndata: [DO"), vec!["data: {\"id\":\"x\"}"]);
        assert_eq!(buf.push(b"NE]\n\n"), vec!["data: [DONE]", ""]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let bytes = "data: 🌍\n".as_bytes();
        let mut buf = LineBuffer::new();
        assert!(buf.push(&bytes[..8]).is_empty());
        assert_eq!(buf.push(&bytes[8..]), vec!["data: 🌍"]);
    }

    #[test]
    fn test_long_line_in_many_small_chunks() {
        let payload = format!("data: {}", "x".repeat(10_000));
        let mut buf = LineBuffer::new();
        for piece in payload.as_bytes().chunks(7) {
            assert!(buf.push(piece).is_empty());
        }
        assert_eq!(buf.scanned, payload.len());
        assert_eq!(buf.push(b"\r\ndata: next"), vec![payload]);
        assert_eq!(buf.scanned, "data: next".len());
        assert_eq!(buf.finish().as_deref(), Some("data: next"));
    }

    #[test]
    fn test_unterminated_tail() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: tail").is_empty());
        assert_eq!(buf.finish().as_deref(), Some("data: tail"));
    }

    // ── Folding ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_fold_skips_malformed_and_stops_at_done() {
        let mut collector = ChunkCollector::new();
        let body = byte_stream(vec![
            ": ping\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"}}]}\n",
            "data: {not json}\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n",
            "data: [DONE]\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ignored\"}}]}\n",
        ]);

        let summary = fold_sse_stream(body, &mut collector).await.unwrap();
        assert_eq!(
            summary,
            FoldSummary {
                fragments: 2,
                skipped: 1,
                saw_done: true
            }
        );

        let resp = collector.build_response();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_fold_handles_chunk_boundaries_mid_payload() {
        let mut collector = ChunkCollector::new();
        let body = byte_stream(vec![
            "data: {\"choices\":[{\"index\":0,\"del",
            "ta\":{\"content\":\"split\"}}]}\r\n\r\ndata:{\"choices\":[{\"index\":0,\"delta\":{\"content\":\"!\"}}]}",
        ]);

        let summary = fold_sse_stream(body, &mut collector).await.unwrap();
        assert_eq!(summary.fragments, 2);
        assert!(!summary.saw_done);
        let resp = collector.build_response();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("split!"));
    }

    #[tokio::test]
    async fn test_fold_surfaces_transport_error() {
        let mut collector = ChunkCollector::new();
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[]}\n")),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset")),
        ]);

        let err = fold_sse_stream(body, &mut collector).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(collector.chunk_count(), 1);
    }
}

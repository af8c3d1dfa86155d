//! Incremental decoder for the provider's server-sent event stream.
//!
//! Turns a raw byte stream of newline-delimited `data: {...}` records into a
//! lazy, in-order stream of content deltas. Lines are only decoded as UTF-8
//! once complete, so a multi-byte character split across two reads comes out
//! intact. A bad record is logged and skipped; it never ends the stream.

use futures_util::stream::{self, Stream, StreamExt};
use std::pin::Pin;

use crate::error::{ChatError, Result};
use crate::providers::OpenAIChunk;

/// Payload of the record that marks the end of the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Accumulates raw bytes and hands out complete lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete line without its terminator (`\n` or `\r\n`).
    pub fn next_line(&mut self) -> Option<Result<String>> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(utf8_line(line))
    }

    /// Whatever is left once the input has ended, if anything.
    pub fn finish(&mut self) -> Option<Result<String>> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(utf8_line(line))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn utf8_line(line: Vec<u8>) -> Result<String> {
    String::from_utf8(line).map_err(|e| ChatError::Decode {
        detail: format!("invalid UTF-8 in record: {e}"),
    })
}

/// Classification of one stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Blank separator line.
    Empty,
    /// `data: [DONE]`.
    Done,
    /// A `data:` event; carries its content delta when there is one.
    Delta(Option<String>),
    /// Another SSE field (`event:`, `id:`, `retry:`) or a `:` comment.
    Ignored,
}

pub fn parse_record(line: &str) -> Result<Record> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Record::Empty);
    }
    let Some(payload) = line.strip_prefix("data:") else {
        if line.starts_with(':')
            || ["event:", "id:", "retry:"].iter().any(|f| line.starts_with(f))
        {
            return Ok(Record::Ignored);
        }
        return Err(ChatError::Decode {
            detail: format!("unexpected line: {}", preview(line)),
        });
    };
    let payload = payload.trim_start();
    if payload == DONE_SENTINEL {
        return Ok(Record::Done);
    }
    let chunk: OpenAIChunk = serde_json::from_str(payload).map_err(|e| ChatError::Decode {
        detail: format!("{e}: {}", preview(payload)),
    })?;
    Ok(Record::Delta(chunk.delta_content().map(str::to_string)))
}

fn preview(s: &str) -> String {
    const MAX: usize = 80;
    match s.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}…", &s[..cut]),
        None => s.to_string(),
    }
}

enum Step {
    Emit(String),
    Stop,
    Skip,
}

fn step(line: Result<String>) -> Step {
    match line.and_then(|l| parse_record(&l)) {
        Ok(Record::Done) => Step::Stop,
        Ok(Record::Delta(Some(delta))) if !delta.is_empty() => Step::Emit(delta),
        Ok(_) => Step::Skip,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed stream record");
            Step::Skip
        }
    }
}

struct DecoderState<S> {
    inner: Pin<Box<S>>,
    lines: LineAssembler,
    finished: bool,
}

/// Decode a provider byte stream into content deltas.
///
/// The returned stream ends at the `[DONE]` sentinel (nothing after it is
/// read) or when the input ends. A transport error is yielded once as
/// [`ChatError::StreamFailure`] and ends the stream. It is consumed by value
/// and cannot be restarted.
pub fn decode<S, B, E>(bytes: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let state = DecoderState {
        inner: Box::pin(bytes),
        lines: LineAssembler::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }
            while let Some(line) = st.lines.next_line() {
                match step(line) {
                    Step::Emit(delta) => return Some((Ok(delta), st)),
                    Step::Stop => {
                        tracing::debug!("stream sentinel received");
                        st.finished = true;
                        return None;
                    }
                    Step::Skip => {}
                }
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.lines.push(chunk.as_ref()),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((
                        Err(ChatError::StreamFailure {
                            status: None,
                            detail: e.to_string(),
                        }),
                        st,
                    ));
                }
                None => {
                    st.finished = true;
                    if let Some(line) = st.lines.finish() {
                        if let Step::Emit(delta) = step(line) {
                            return Some((Ok(delta), st));
                        }
                    }
                    return None;
                }
            }
        }
    })
    .fuse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = std::result::Result<Vec<u8>, String>> {
        stream::iter(parts.iter().map(|p| Ok(p.to_vec())).collect::<Vec<_>>())
    }

    fn data(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]})
        )
    }

    // -- record classification --

    #[rstest]
    #[case("", Record::Empty)]
    #[case("   ", Record::Empty)]
    #[case("data: [DONE]", Record::Done)]
    #[case("data:[DONE]", Record::Done)]
    #[case("event: message", Record::Ignored)]
    #[case(": keep-alive", Record::Ignored)]
    #[case(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#, Record::Delta(Some("Hi".to_string())))]
    #[case(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#, Record::Delta(None))]
    #[case(r#"data: {"choices":[]}"#, Record::Delta(None))]
    fn test_parse_record(#[case] line: &str, #[case] expected: Record) {
        assert_eq!(parse_record(line).expect("parse"), expected);
    }

    #[rstest]
    #[case("data: {not json")]
    #[case(r#"data: {"unexpected": true}"#)]
    #[case("garbage")]
    fn test_parse_record_malformed(#[case] line: &str) {
        assert!(matches!(parse_record(line), Err(ChatError::Decode { .. })));
    }

    // -- line assembly --

    #[test]
    fn test_line_assembler_crlf() {
        let mut la = LineAssembler::new();
        la.push(b"one\r\ntwo\n");
        assert_eq!(la.next_line().expect("line").expect("utf8"), "one");
        assert_eq!(la.next_line().expect("line").expect("utf8"), "two");
        assert!(la.next_line().is_none());
        assert!(la.is_empty());
    }

    #[test]
    fn test_line_assembler_split_multibyte() {
        let text = "é🙂\n".as_bytes();
        let mut la = LineAssembler::new();
        la.push(&text[..1]);
        assert!(la.next_line().is_none());
        la.push(&text[1..4]);
        assert!(la.next_line().is_none());
        la.push(&text[4..]);
        assert_eq!(la.next_line().expect("line").expect("utf8"), "é🙂");
    }

    #[test]
    fn test_line_assembler_finish_returns_remainder() {
        let mut la = LineAssembler::new();
        la.push(b"tail");
        assert!(la.next_line().is_none());
        assert_eq!(la.finish().expect("rest").expect("utf8"), "tail");
        assert!(la.finish().is_none());
    }

    // -- decode --

    #[tokio::test]
    async fn test_decode_yields_in_order_and_stops_at_sentinel() {
        let body = format!(
            "{}{}{}{}data: [DONE]\n\n{}",
            data("The"),
            data(" sky"),
            data(" is"),
            data(" blue."),
            data(" extra")
        );
        let deltas: Vec<String> = decode(chunks(&[body.as_bytes()]))
            .map(|r| r.expect("delta"))
            .collect()
            .await;
        assert_eq!(deltas, vec!["The", " sky", " is", " blue."]);
    }

    #[tokio::test]
    async fn test_decode_does_not_read_past_sentinel() {
        let first: std::result::Result<Vec<u8>, String> = Ok(b"data: [DONE]\n".to_vec());
        let poisoned = stream::poll_fn(
            |_| -> std::task::Poll<Option<std::result::Result<Vec<u8>, String>>> {
                panic!("read after sentinel")
            },
        );
        let input = stream::iter(vec![first]).chain(poisoned);
        let deltas: Vec<_> = decode(input).collect().await;
        assert!(deltas.is_empty());
    }

    #[tokio::test]
    async fn test_decode_skips_malformed_record() {
        let body = format!("{}data: {{oops\n\n{}", data("a"), data("b"));
        let deltas: Vec<String> = decode(chunks(&[body.as_bytes()]))
            .map(|r| r.expect("delta"))
            .collect()
            .await;
        assert_eq!(deltas, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_decode_skips_invalid_utf8_line() {
        let mut body = data("a").into_bytes();
        body.extend_from_slice(b"data: \xff\xfe\n");
        body.extend_from_slice(data("b").as_bytes());
        let deltas: Vec<String> = decode(chunks(&[body.as_slice()]))
            .map(|r| r.expect("delta"))
            .collect()
            .await;
        assert_eq!(deltas, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_decode_transport_error_ends_stream() {
        let input = stream::iter(vec![
            Ok(data("a").into_bytes()),
            Err("connection reset".to_string()),
            Ok(data("b").into_bytes()),
        ]);
        let items: Vec<Result<String>> = decode(input).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().expect("delta"), "a");
        assert!(matches!(items[1], Err(ChatError::StreamFailure { status: None, .. })));
    }

    #[tokio::test]
    async fn test_decode_processes_unterminated_tail() {
        let body = r#"data: {"choices":[{"delta":{"content":"end"}}]}"#;
        let deltas: Vec<String> = decode(chunks(&[body.as_bytes()]))
            .map(|r| r.expect("delta"))
            .collect()
            .await;
        assert_eq!(deltas, vec!["end"]);
    }

    #[tokio::test]
    async fn test_decode_empty_input() {
        let deltas: Vec<_> = decode(chunks(&[])).collect().await;
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let p = preview(&long);
        assert!(p.ends_with('…'));
        assert_eq!(p.chars().count(), 81);
    }
}

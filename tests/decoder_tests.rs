//! Property tests for the stream decoder: output must not depend on how the
//! transport happened to chunk the body, and bad records never cost good ones.

use futures_util::stream::{self, StreamExt};
use proptest::prelude::*;

use chatprob::decoder::decode;

fn record(content: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]})
    )
}

fn body(fragments: &[String], noise: &[String]) -> Vec<u8> {
    let mut out = String::from(": stream opened\n\n");
    for (i, f) in fragments.iter().enumerate() {
        if let Some(junk) = noise.get(i) {
            out.push_str(junk);
            out.push('\n');
        }
        out.push_str(&record(f));
    }
    out.push_str("data: [DONE]\n\n");
    out.into_bytes()
}

/// Cut `bytes` at the given offsets (taken modulo the length).
fn split(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![];
    }
    let mut cuts: Vec<usize> = cuts.iter().map(|c| c % bytes.len()).collect();
    cuts.sort_unstable();
    cuts.dedup();
    let mut parts = Vec::new();
    let mut start = 0;
    for cut in cuts {
        parts.push(bytes[start..cut].to_vec());
        start = cut;
    }
    parts.push(bytes[start..].to_vec());
    parts
}

fn run(parts: Vec<Vec<u8>>) -> Vec<String> {
    let input = stream::iter(parts.into_iter().map(Ok::<_, String>));
    tokio_test::block_on(decode(input).map(|r| r.expect("delta")).collect::<Vec<_>>())
}

fn fragment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .,!?é🙂\n\"]{1,12}"
}

fn junk_line() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("data: {broken".to_string()),
        Just("data: {\"unexpected\": 1}".to_string()),
        Just("event: ping".to_string()),
        Just(": keep-alive".to_string()),
        "[a-z]{1,10}".prop_map(|s| format!("nonsense {s}")),
    ]
}

proptest! {
    #[test]
    fn test_chunking_does_not_change_output(
        fragments in prop::collection::vec(fragment(), 0..12),
        cuts in prop::collection::vec(any::<usize>(), 0..24),
    ) {
        let bytes = body(&fragments, &[]);
        let whole = run(vec![bytes.clone()]);
        let chunked = run(split(&bytes, &cuts));
        prop_assert_eq!(&whole, &fragments);
        prop_assert_eq!(chunked, fragments);
    }

    #[test]
    fn test_byte_at_a_time_matches_whole(fragments in prop::collection::vec(fragment(), 1..6)) {
        let bytes = body(&fragments, &[]);
        let singles: Vec<Vec<u8>> = bytes.iter().map(|b| vec![*b]).collect();
        prop_assert_eq!(run(singles), fragments);
    }

    #[test]
    fn test_malformed_records_are_skipped(
        fragments in prop::collection::vec(fragment(), 1..10),
        noise in prop::collection::vec(junk_line(), 0..10),
        cuts in prop::collection::vec(any::<usize>(), 0..8),
    ) {
        let bytes = body(&fragments, &noise);
        prop_assert_eq!(run(split(&bytes, &cuts)), fragments);
    }

    #[test]
    fn test_concatenation_equals_streamed_text(fragments in prop::collection::vec(fragment(), 0..12)) {
        let bytes = body(&fragments, &[]);
        let joined: String = run(vec![bytes]).concat();
        prop_assert_eq!(joined, fragments.concat());
    }
}

#[test]
fn test_nothing_after_sentinel_is_emitted() {
    let mut bytes = body(&["before".to_string()], &[]);
    bytes.extend_from_slice(record("after").as_bytes());
    assert_eq!(run(vec![bytes]), vec!["before"]);
}

#[test]
fn test_missing_sentinel_still_ends_cleanly() {
    let bytes = format!("{}{}", record("a"), record("b").trim_end()).into_bytes();
    assert_eq!(run(vec![bytes]), vec!["a", "b"]);
}

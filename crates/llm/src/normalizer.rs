//! Best-effort reconstruction of reply text from vendor-shaped stream chunks.
//!
//! Chunks are untyped JSON. Each one goes through an ordered chain of decode
//! attempts; the first shape that matches supplies the text for that chunk.

use murmur_storage::TokenUsage;
use serde_json::{Map, Value};

/// One streamed unit exactly as the backend produced it.
pub type RawChunk = Value;

/// Alternate top-level keys some vendors use to carry reasoning text.
const REASONING_KEYS: [&str; 4] = ["reasoning_content", "reasoning", "thinking", "reasoning_text"];

/// Marker pairs scanned for when a backend inlines its reasoning into the answer text.
const THINKING_MARKERS: [(&str, &str); 4] = [
    ("<think>", "</think>"),
    ("<thinking>", "</thinking>"),
    ("<reasoning>", "</reasoning>"),
    ("Reasoning:", "Answer:"),
];

const TOTAL_KEYS: [&str; 2] = ["total_tokens", "totalTokens"];
const PROMPT_KEYS: [&str; 4] = ["prompt_tokens", "input_tokens", "promptTokens", "inputTokens"];
const COMPLETION_KEYS: [&str; 4] = [
    "completion_tokens",
    "output_tokens",
    "completionTokens",
    "outputTokens",
];

/// State threaded through successive [`fold_chunk`] calls for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkAccumulator {
    pub content: String,
    pub thinking: String,
    pub usage: Option<TokenUsage>,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combined text length, used to detect growth between folds.
    pub fn text_len(&self) -> usize {
        self.content.len() + self.thinking.len()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Fragment {
    content: String,
    thinking: String,
}

impl Fragment {
    fn content(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            thinking: String::new(),
        }
    }

    fn thinking(text: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            thinking: text.into(),
        }
    }

    fn append(&mut self, other: Fragment) {
        self.content.push_str(&other.content);
        self.thinking.push_str(&other.thinking);
    }
}

/// Folds one chunk into the accumulator.
///
/// The fold is split-invariant: every decision depends only on the chunk and the
/// accumulator, so folding a sequence in one pass or in two halves agrees.
pub fn fold_chunk(chunk: &RawChunk, mut accumulator: ChunkAccumulator) -> ChunkAccumulator {
    let fragment = decode_chunk(chunk);
    accumulator.content.push_str(&fragment.content);
    accumulator.thinking.push_str(&fragment.thinking);

    if let Some(usage) = extract_usage(chunk) {
        accumulator.usage = Some(accumulator.usage.unwrap_or_default().max_merge(usage));
    }

    if accumulator.thinking.is_empty()
        && !accumulator.content.is_empty()
        && let Some((thinking, answer)) = split_marked_thinking(&accumulator.content)
    {
        accumulator.thinking = thinking;
        accumulator.content = answer;
    }

    accumulator
}

/// Folds a whole chunk sequence starting from `initial`.
pub fn fold_chunks<'a, I>(chunks: I, initial: ChunkAccumulator) -> ChunkAccumulator
where
    I: IntoIterator<Item = &'a RawChunk>,
{
    chunks.into_iter().fold(initial, |accumulator, chunk| fold_chunk(chunk, accumulator))
}

/// Single pass over a full chunk history taking the per-counter maximum.
pub fn aggregate_usage(chunks: &[RawChunk]) -> Option<TokenUsage> {
    chunks
        .iter()
        .filter_map(extract_usage)
        .reduce(TokenUsage::max_merge)
}

fn decode_chunk(chunk: &RawChunk) -> Fragment {
    match chunk {
        Value::String(text) => Fragment::content(text.as_str()),
        Value::Object(map) => decode_object(map),
        Value::Array(parts) => decode_parts(parts),
        // Scalar fallback: stringify into content.
        Value::Number(number) => Fragment::content(number.to_string()),
        Value::Bool(flag) => Fragment::content(flag.to_string()),
        Value::Null => Fragment::default(),
    }
}

fn decode_object(map: &Map<String, Value>) -> Fragment {
    let mut fragment = Fragment::default();
    let mut matched = false;

    if let Some(Value::String(text)) = map.get("content") {
        fragment.content.push_str(text);
        matched = true;
    }

    if let Some(reasoning) = reasoning_annotation(map) {
        fragment.thinking.push_str(reasoning);
        matched = true;
    }

    if matched {
        return fragment;
    }

    match (map.get("content"), map.get("delta"), map.get("choices")) {
        (Some(Value::Array(parts)), _, _) => decode_parts(parts),
        (Some(part @ Value::Object(_)), _, _) => decode_part(part),
        (_, Some(Value::Object(delta)), _) => {
            if delta.contains_key("type") {
                decode_part_map(delta)
            } else {
                decode_object(delta)
            }
        }
        (_, _, Some(Value::Array(choices))) => choices
            .first()
            .and_then(|choice| choice.get("delta").or_else(|| choice.get("message")))
            .and_then(Value::as_object)
            .map(decode_object)
            .unwrap_or_default(),
        _ if map.contains_key("type") => decode_part_map(map),
        _ => Fragment::default(),
    }
}

fn reasoning_annotation(map: &Map<String, Value>) -> Option<&str> {
    fn from_map(source: &Map<String, Value>) -> Option<&str> {
        REASONING_KEYS
            .iter()
            .find_map(|key| source.get(*key).and_then(Value::as_str))
    }

    from_map(map).or_else(|| {
        map.get("additional_kwargs")
            .and_then(Value::as_object)
            .and_then(from_map)
    })
}

fn decode_parts(parts: &[Value]) -> Fragment {
    let mut fragment = Fragment::default();
    for part in parts {
        fragment.append(decode_part(part));
    }
    fragment
}

fn decode_part(part: &Value) -> Fragment {
    match part {
        Value::String(text) => Fragment::content(text.as_str()),
        Value::Object(map) => decode_part_map(map),
        _ => Fragment::default(),
    }
}

fn decode_part_map(map: &Map<String, Value>) -> Fragment {
    let kind = map.get("type").and_then(Value::as_str).unwrap_or("text");
    let first_text = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string()
    };

    match kind {
        "thinking" | "thinking_delta" | "reasoning" | "reasoning_delta" => {
            Fragment::thinking(first_text(&["thinking", "reasoning", "text"]))
        }
        "text" | "text_delta" | "output_text" => Fragment::content(first_text(&["text"])),
        _ => Fragment::default(),
    }
}

fn extract_usage(chunk: &RawChunk) -> Option<TokenUsage> {
    let map = chunk.as_object()?;
    let candidates = [
        map.get("usage_metadata"),
        map.get("usage"),
        map.get("response_metadata")
            .and_then(|metadata| metadata.get("tokenUsage").or_else(|| metadata.get("usage"))),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter_map(read_usage_counters)
        .reduce(TokenUsage::max_merge)
}

fn read_usage_counters(map: &Map<String, Value>) -> Option<TokenUsage> {
    let read = |keys: &[&str]| keys.iter().find_map(|key| map.get(*key).and_then(Value::as_u64));

    let total = read(&TOTAL_KEYS);
    let prompt = read(&PROMPT_KEYS);
    let completion = read(&COMPLETION_KEYS);
    if total.is_none() && prompt.is_none() && completion.is_none() {
        return None;
    }

    let prompt = prompt.unwrap_or_default();
    let completion = completion.unwrap_or_default();
    Some(TokenUsage::new(
        total.unwrap_or(prompt + completion),
        prompt,
        completion,
    ))
}

/// Splits inlined reasoning out of `content` at the first recognized marker pair.
/// Text outside the markers stays in the answer verbatim.
fn split_marked_thinking(content: &str) -> Option<(String, String)> {
    THINKING_MARKERS.iter().find_map(|(start, end)| {
        let start_index = content.find(start)?;
        let body_start = start_index + start.len();
        let end_offset = content[body_start..].find(end)?;
        let body_end = body_start + end_offset;

        let thinking = content[body_start..body_end].to_string();
        let mut answer = content[..start_index].to_string();
        answer.push_str(&content[body_end + end.len()..]);
        Some((thinking, answer))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fold_all(chunks: &[RawChunk]) -> ChunkAccumulator {
        fold_chunks(chunks, ChunkAccumulator::new())
    }

    #[test]
    fn plain_content_fragments_concatenate() {
        let chunks = vec![json!({"content": "Hello"}), json!({"content": " world"})];
        let result = fold_all(&chunks);
        assert_eq!(result.content, "Hello world");
        assert_eq!(result.thinking, "");
    }

    #[test]
    fn reasoning_annotation_goes_to_thinking() {
        let chunks = vec![json!({
            "content": "42",
            "additional_kwargs": {"reasoning_content": "step1"}
        })];
        let result = fold_all(&chunks);
        assert_eq!(result.content, "42");
        assert_eq!(result.thinking, "step1");
    }

    #[test]
    fn top_level_reasoning_key_wins_over_nested_annotation() {
        let chunks = vec![
            json!({"reasoning": "outer", "additional_kwargs": {"reasoning_content": "inner"}}),
            json!({"additional_kwargs": {"thinking": " nested"}, "content": "ok"}),
        ];
        let result = fold_all(&chunks);
        assert_eq!(result.thinking, "outer nested");
        assert_eq!(result.content, "ok");
    }

    #[test]
    fn discriminated_parts_split_channels() {
        let chunks = vec![
            json!({"content": [{"type": "thinking", "thinking": "consider"}]}),
            json!({"content": [{"type": "text", "text": "done"}]}),
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "!"}}),
        ];
        let result = fold_all(&chunks);
        assert_eq!(result.thinking, "consider");
        assert_eq!(result.content, "done!");
    }

    #[test]
    fn openai_choice_deltas_are_understood() {
        let chunks = vec![
            json!({"choices": [{"delta": {"reasoning_content": "hmm"}}]}),
            json!({"choices": [{"delta": {"content": "yes"}}]}),
        ];
        let result = fold_all(&chunks);
        assert_eq!(result.thinking, "hmm");
        assert_eq!(result.content, "yes");
    }

    #[test]
    fn scalars_fall_back_to_stringification() {
        let chunks = vec![json!("a"), json!(1), json!(true), Value::Null];
        assert_eq!(fold_all(&chunks).content, "a1true");
    }

    #[test]
    fn metadata_only_chunks_add_no_text() {
        let chunks = vec![json!({"usage_metadata": {"total_tokens": 5}})];
        let result = fold_all(&chunks);
        assert_eq!(result.text_len(), 0);
        assert_eq!(result.usage, Some(TokenUsage::new(5, 0, 0)));
    }

    #[test]
    fn inline_markers_are_split_when_no_thinking_channel_exists() {
        let chunks = vec![
            json!({"content": "<think>plan"}),
            json!({"content": " carefully</think>"}),
            json!({"content": "answer"}),
        ];
        let result = fold_all(&chunks);
        assert_eq!(result.thinking, "plan carefully");
        assert_eq!(result.content, "answer");
    }

    #[test]
    fn markers_are_left_alone_once_a_thinking_channel_exists() {
        let chunks = vec![json!({
            "content": "<think>x</think>y",
            "reasoning_content": "real"
        })];
        let result = fold_all(&chunks);
        assert_eq!(result.thinking, "real");
        assert_eq!(result.content, "<think>x</think>y");
    }

    #[test]
    fn fold_is_split_invariant_at_every_cut() {
        let chunks = vec![
            json!({"content": "Reasoning: weigh"}),
            json!({"content": " options Answer: "}),
            json!("B"),
            json!({"content": [{"type": "text", "text": "!"}]}),
            json!({"usage": {"prompt_tokens": 4, "completion_tokens": 2}}),
            json!({"content": " <think>not split</think>"}),
            json!({"usage_metadata": {"total_tokens": 9, "output_tokens": 5}}),
        ];
        let whole = fold_all(&chunks);
        assert_eq!(whole.thinking, " weigh options ");
        assert_eq!(whole.content, " B! <think>not split</think>");

        for cut in 0..=chunks.len() {
            let (head, tail) = chunks.split_at(cut);
            let resumed = fold_chunks(tail, fold_all(head));
            assert_eq!(resumed, whole, "cut at {cut}");
        }
    }

    #[test]
    fn usage_is_max_so_far_and_never_decreases() {
        let chunks = vec![
            json!({"usage": {"prompt_tokens": 10, "completion_tokens": 1, "total_tokens": 11}}),
            json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}}),
            json!({"usage": {"total_tokens": 3}}),
            json!({"response_metadata": {"tokenUsage": {"promptTokens": 12}}}),
        ];

        let mut accumulator = ChunkAccumulator::new();
        let mut previous = TokenUsage::default();
        for chunk in &chunks {
            accumulator = fold_chunk(chunk, accumulator);
            let current = accumulator.usage.unwrap_or_default();
            assert!(current.total >= previous.total);
            assert!(current.prompt >= previous.prompt);
            assert!(current.completion >= previous.completion);
            previous = current;
        }

        assert_eq!(aggregate_usage(&chunks), Some(TokenUsage::new(15, 12, 5)));
        assert_eq!(aggregate_usage(&[json!({"content": "x"})]), None);
    }
}

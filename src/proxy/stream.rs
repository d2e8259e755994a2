//! Folds a streamed chat completion back into a single `chat.completion`.
//!
//! Some Copilot models only answer with `stream: true`. When a caller asks
//! for a plain JSON reply, the gateway streams from upstream anyway and feeds
//! every decoded fragment into a [`ChunkCollector`], then materializes the
//! non-streaming shape with [`ChunkCollector::build_response`].
//!
//! Choice and tool-call indices are upstream-assigned keys, not positions:
//! they may arrive out of order or with gaps.

use std::collections::{BTreeMap, HashMap};

use crate::models::chat::{
    ChatCompletion, ChatCompletionChunk, ChatMessage, Choice, ChunkChoice, ContentFilterResults,
    FunctionCall, PromptFilterResult, ToolCall, ToolCallDelta, Usage,
};

const DEFAULT_ROLE: &str = "assistant";
const DEFAULT_TOOL_TYPE: &str = "function";
const COMPLETION_OBJECT: &str = "chat.completion";

/// Aggregation state for one emulated request. Consumed by `build_response`.
#[derive(Debug, Default)]
pub struct ChunkCollector {
    id: String,
    object: String,
    created: i64,
    model: String,
    system_fingerprint: String,
    usage: Option<Usage>,
    prompt_filter_results: Option<Vec<PromptFilterResult>>,
    choices: BTreeMap<u32, ChoiceAccumulator>,
    chunk_count: u32,
}

#[derive(Debug, Default)]
struct ChoiceAccumulator {
    role: String,
    content: String,
    /// First-seen order.
    tool_calls: Vec<ToolCallAccumulator>,
    /// Upstream tool-call index -> position in `tool_calls`.
    tool_slots: HashMap<u32, usize>,
    finish_reason: Option<String>,
    content_filter_results: Option<ContentFilterResults>,
}

/// Owned copy of everything learned about one tool call. Never borrows from
/// the fragment it was first seen in.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    kind: String,
    name: String,
    arguments: String,
}

impl ChunkCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fragments folded so far.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Merges one decoded fragment into the state.
    pub fn add_chunk(&mut self, chunk: ChatCompletionChunk) {
        self.chunk_count += 1;

        overwrite_non_empty(&mut self.id, chunk.id);
        overwrite_non_empty(&mut self.object, chunk.object);
        overwrite_non_empty(&mut self.model, chunk.model);
        overwrite_non_empty(&mut self.system_fingerprint, chunk.system_fingerprint);
        if let Some(created) = chunk.created.filter(|c| *c != 0) {
            self.created = created;
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        if let Some(results) = chunk.prompt_filter_results.filter(|r| !r.is_empty()) {
            self.prompt_filter_results = Some(results);
        }

        for choice in chunk.choices {
            self.choices
                .entry(choice.index)
                .or_default()
                .merge(choice);
        }
    }

    /// Materializes the non-streaming response. Choices come out in ascending
    /// index order.
    pub fn build_response(self) -> ChatCompletion {
        let object = match self.object.strip_suffix(".chunk") {
            Some(base) if !base.is_empty() => base.to_string(),
            Some(_) => COMPLETION_OBJECT.to_string(),
            None if self.object.is_empty() => COMPLETION_OBJECT.to_string(),
            None => self.object.clone(),
        };

        let choices = self
            .choices
            .into_iter()
            .map(|(index, acc)| acc.finish(index))
            .collect();

        ChatCompletion {
            id: self.id,
            object,
            created: self.created,
            model: self.model,
            system_fingerprint: self.system_fingerprint,
            choices,
            usage: self.usage,
            prompt_filter_results: self.prompt_filter_results,
        }
    }
}

impl ChoiceAccumulator {
    fn merge(&mut self, choice: ChunkChoice) {
        if let Some(delta) = choice.delta {
            overwrite_non_empty(&mut self.role, delta.role);
            if let Some(text) = delta.content {
                self.content.push_str(&text);
            }
            for call in delta.tool_calls.into_iter().flatten() {
                self.merge_tool_call(call);
            }
        }

        // Latched: a fragment without a reason never clears one.
        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            self.finish_reason = Some(reason);
        }
        if let Some(results) = choice.content_filter_results.filter(|r| !r.is_empty()) {
            self.content_filter_results = Some(results);
        }
    }

    fn merge_tool_call(&mut self, delta: ToolCallDelta) {
        let function = delta.function.unwrap_or_default();

        let slot = match self.tool_slots.get(&delta.index) {
            Some(&slot) => slot,
            None => {
                self.tool_calls.push(ToolCallAccumulator::default());
                let slot = self.tool_calls.len() - 1;
                self.tool_slots.insert(delta.index, slot);
                slot
            }
        };
        let call = &mut self.tool_calls[slot];

        // Identity comes from the first fragment that carries it.
        fill_if_empty(&mut call.id, delta.id);
        fill_if_empty(&mut call.kind, delta.kind);
        fill_if_empty(&mut call.name, function.name);
        if let Some(fragment) = function.arguments {
            call.arguments.push_str(&fragment);
        }
    }

    fn finish(self, index: u32) -> Choice {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                kind: if call.kind.is_empty() {
                    DEFAULT_TOOL_TYPE.to_string()
                } else {
                    call.kind
                },
                function: FunctionCall {
                    name: call.name,
                    arguments: call.arguments,
                },
            })
            .collect();

        Choice {
            index,
            message: ChatMessage {
                role: if self.role.is_empty() {
                    DEFAULT_ROLE.to_string()
                } else {
                    self.role
                },
                content: (!self.content.is_empty()).then_some(self.content),
                tool_calls,
            },
            finish_reason: self.finish_reason,
            content_filter_results: self.content_filter_results,
        }
    }
}

fn overwrite_non_empty(slot: &mut String, incoming: Option<String>) {
    if let Some(value) = incoming.filter(|v| !v.is_empty()) {
        *slot = value;
    }
}

fn fill_if_empty(slot: &mut String, incoming: Option<String>) {
    if slot.is_empty() {
        overwrite_non_empty(slot, incoming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(json: &str) -> ChatCompletionChunk {
        serde_json::from_str(json).unwrap()
    }

    fn collect(lines: &[&str]) -> ChatCompletion {
        let mut collector = ChunkCollector::new();
        for line in lines {
            collector.add_chunk(chunk(line));
        }
        collector.build_response()
    }

    // ── Text ────────────────────────────────────────────────────

    #[test]
    fn test_text_concatenation() {
        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hello"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"!"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":" world"}}]}"#,
        ]);
        assert_eq!(resp.choices.len(), 1);
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello! world"));
        assert_eq!(resp.choices[0].message.role, "assistant");
    }

    #[test]
    fn test_null_content_contributes_nothing() {
        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{"content":"a"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":null}}]}"#,
            r#"{"choices":[{"index":0,"delta":{}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"b"}}]}"#,
        ]);
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("ab"));
    }

    #[test]
    fn test_no_text_is_null_not_empty_string() {
        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        ]);
        assert_eq!(resp.choices[0].message.content, None);
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json["choices"][0]["message"]["content"].is_null());
    }

    #[test]
    fn test_role_defaults_to_assistant_and_later_role_overwrites() {
        let resp = collect(&[r#"{"choices":[{"index":0,"delta":{"content":"x"}}]}"#]);
        assert_eq!(resp.choices[0].message.role, "assistant");

        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"role":""}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"role":"tool"}}]}"#,
        ]);
        assert_eq!(resp.choices[0].message.role, "tool");
    }

    // ── Tool calls ──────────────────────────────────────────────

    #[test]
    fn test_tool_call_arguments_concatenate_as_raw_text() {
        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"f","arguments":""}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\""}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1}"}}]}}]}"#,
        ]);
        let calls = &resp.choices[0].message.tool_calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "f");
        assert_eq!(calls[0].function.arguments, r#"{"a":1}"#);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].kind, "function");
    }

    #[test]
    fn test_tool_calls_keep_first_seen_order_with_sparse_indices() {
        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":5,"id":"call_b","function":{"name":"second_index","arguments":"{"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":2,"id":"call_a","function":{"name":"first_index","arguments":"["}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":5,"function":{"arguments":"}"}},{"index":2,"function":{"arguments":"]"}}]}}]}"#,
        ]);
        let calls = &resp.choices[0].message.tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.name, "second_index");
        assert_eq!(calls[0].function.arguments, "{}");
        assert_eq!(calls[1].function.name, "first_index");
        assert_eq!(calls[1].function.arguments, "[]");
    }

    #[test]
    fn test_tool_identity_fixed_by_first_fragment() {
        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":""}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_other","function":{"name":"ignored","arguments":"{}"}}]}}]}"#,
        ]);
        let call = &resp.choices[0].message.tool_calls[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.function.name, "lookup");
        assert_eq!(call.function.arguments, "{}");
    }

    #[test]
    fn test_same_tool_index_in_different_choices_is_separate() {
        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"c0","function":{"name":"a","arguments":"1"}}]}},{"index":1,"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"b","arguments":"2"}}]}}]}"#,
        ]);
        assert_eq!(resp.choices[0].message.tool_calls[0].function.arguments, "1");
        assert_eq!(resp.choices[1].message.tool_calls[0].function.arguments, "2");
    }

    // ── Finish reason ───────────────────────────────────────────

    #[test]
    fn test_finish_reason_is_latched() {
        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{"content":"x"},"finish_reason":"stop"}]}"#,
            r#"{"choices":[{"index":0,"delta":{}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":null}]}"#,
        ]);
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_last_finish_reason_wins() {
        let resp = collect(&[
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"length"}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        ]);
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    // ── Choices ─────────────────────────────────────────────────

    #[test]
    fn test_choice_order_independent_of_arrival() {
        let a1 = r#"{"choices":[{"index":0,"delta":{"content":"zero-"}}]}"#;
        let a2 = r#"{"choices":[{"index":0,"delta":{"content":"done"},"finish_reason":"stop"}]}"#;
        let b1 = r#"{"choices":[{"index":3,"delta":{"content":"three-"}}]}"#;
        let b2 = r#"{"choices":[{"index":3,"delta":{"content":"done"},"finish_reason":"length"}]}"#;

        let forward = collect(&[a1, a2, b1, b2]);
        let interleaved = collect(&[b1, a1, b2, a2]);
        assert_eq!(forward.choices, interleaved.choices);

        assert_eq!(forward.choices[0].index, 0);
        assert_eq!(forward.choices[1].index, 3);
        assert_eq!(forward.choices[1].message.content.as_deref(), Some("three-done"));
    }

    // ── Top-level fields ────────────────────────────────────────

    #[test]
    fn test_top_level_last_non_empty_wins() {
        let resp = collect(&[
            r#"{"id":"first","model":"m1","created":100,"system_fingerprint":"fp_1","object":"chat.completion.chunk","choices":[]}"#,
            r#"{"id":"","model":null,"created":0,"choices":[]}"#,
            r#"{"id":"second","choices":[]}"#,
        ]);
        assert_eq!(resp.id, "second");
        assert_eq!(resp.model, "m1");
        assert_eq!(resp.created, 100);
        assert_eq!(resp.system_fingerprint, "fp_1");
        assert_eq!(resp.object, "chat.completion");
        assert!(resp.choices.is_empty());
    }

    #[test]
    fn test_usage_replaced_wholesale() {
        let resp = collect(&[
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6,"prompt_tokens_details":{"cached_tokens":2}}}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":9,"total_tokens":14}}"#,
        ]);
        let usage = resp.usage.unwrap();
        assert_eq!(usage.completion_tokens, 9);
        assert!(usage.details.is_empty(), "no field-by-field merge");
    }

    #[test]
    fn test_empty_stream_builds_empty_completion() {
        let resp = ChunkCollector::new().build_response();
        assert_eq!(resp.object, "chat.completion");
        assert!(resp.choices.is_empty());
        assert!(resp.usage.is_none());
    }

    // ── Captured Copilot streams ────────────────────────────────

    const FILTERS: &str = r#"{"hate":{"filtered":false,"severity":"safe"},"self_harm":{"filtered":false,"severity":"safe"},"sexual":{"filtered":false,"severity":"safe"},"violence":{"filtered":false,"severity":"safe"}}"#;

    #[test]
    fn test_copilot_tool_call_stream() {
        let head = r#""created":1747591235,"id":"chatcmpl-BYcbLSepxSXIxgUX2WZCFZrjqjp0l","model":"gpt-4o-2024-11-20","system_fingerprint":"fp_ee1d74bde0""#;
        let prompt_filter = format!(
            r#"{{"choices":[],"created":0,"id":"","prompt_filter_results":[{{"content_filter_results":{},"prompt_index":0}}]}}"#,
            FILTERS
        );
        let mut lines = vec![
            prompt_filter,
            format!(
                r#"{{"choices":[{{"index":0,"delta":{{"content":null,"role":"assistant","tool_calls":[{{"function":{{"arguments":"","name":"get_weather"}},"id":"call_7m75SYp4UrPhxhtdZdawEK5J","index":0,"type":"function"}}]}}}}],{}}}"#,
                head
            ),
        ];
        for piece in [r#"{\""#, "location", r#"\":\""#, "San", " Francisco", r#"\"}"#] {
            lines.push(format!(
                r#"{{"choices":[{{"index":0,"delta":{{"content":null,"tool_calls":[{{"function":{{"arguments":"{}"}},"index":0}}]}}}}],{}}}"#,
                piece, head
            ));
        }
        lines.push(format!(
            r#"{{"choices":[{{"finish_reason":"tool_calls","index":0,"delta":{{"content":null}}}}],"usage":{{"completion_tokens":16,"prompt_tokens":73,"prompt_tokens_details":{{"cached_tokens":0}},"total_tokens":89}},{}}}"#,
            head
        ));

        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let resp = collect(&refs);

        assert_eq!(resp.id, "chatcmpl-BYcbLSepxSXIxgUX2WZCFZrjqjp0l");
        assert_eq!(resp.created, 1747591235);
        assert_eq!(resp.model, "gpt-4o-2024-11-20");
        assert_eq!(resp.prompt_filter_results.as_ref().unwrap().len(), 1);
        assert_eq!(resp.usage.as_ref().unwrap().total_tokens, 89);

        let choice = &resp.choices[0];
        assert_eq!(choice.message.role, "assistant");
        assert_eq!(choice.message.content, None);
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let call = &choice.message.tool_calls[0];
        assert_eq!(call.id, "call_7m75SYp4UrPhxhtdZdawEK5J");
        assert_eq!(call.function.name, "get_weather");
        assert_eq!(call.function.arguments, r#"{"location":"San Francisco"}"#);
    }

    #[test]
    fn test_copilot_text_stream_with_content_filters() {
        let mut collector = ChunkCollector::new();
        let pieces = ["", "Hello", "!", " How", " can", " I", " assist", " you", " today", "?", " 🌍"];
        for (i, piece) in pieces.iter().enumerate() {
            let role = if i == 0 { r#","role":"assistant""# } else { "" };
            collector.add_chunk(chunk(&format!(
                r#"{{"choices":[{{"index":0,"content_filter_results":{},"delta":{{"content":"{}"{}}}}}],"created":1747592466,"id":"chatcmpl-BYcvCkaKJjQIM7e2j6vg08RIcY8qp","model":"gpt-4o-2024-11-20"}}"#,
                FILTERS, piece, role
            )));
        }
        collector.add_chunk(chunk(&format!(
            r#"{{"choices":[{{"finish_reason":"stop","index":0,"content_filter_results":{},"delta":{{"content":null}}}}],"usage":{{"completion_tokens":13,"prompt_tokens":1675,"total_tokens":1688}}}}"#,
            FILTERS
        )));
        assert_eq!(collector.chunk_count(), 12);

        let resp = collector.build_response();
        let choice = &resp.choices[0];
        assert_eq!(
            choice.message.content.as_deref(),
            Some("Hello! How can I assist you today? 🌍")
        );
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
        assert!(choice.message.tool_calls.is_empty());
        let filters = choice.content_filter_results.as_ref().unwrap();
        assert_eq!(filters["hate"]["severity"], "safe");
    }
}

//! Usage reconciliation: trust what upstream reported, estimate the rest.
use crate::observability::token_counter::Tokenizer;
use crate::protocol::canonical::{OutputItem, OutputItemKind, Usage};

/// Everything the reconciler may draw on at finalize.
#[derive(Debug, Clone, Copy)]
pub struct UsageSources<'a> {
    pub reported: Option<Usage>,
    /// Running text (visible text, reasoning and tool-call payload).
    pub text: &'a str,
    pub snapshot_outputs: &'a [OutputItem],
    pub merged_outputs: &'a [OutputItem],
    pub prompt_estimate: u64,
    pub model: &'a str,
}

/// Produce final usage. Non-zero reported fields are never changed.
///
/// A zero completion count is estimated from the first non-empty of: the
/// running text, text extracted from the snapshot outputs, text extracted
/// from the merged outputs. When outputs exist but hold no extractable text
/// their serialized form is counted instead.
#[must_use]
pub fn reconcile(sources: &UsageSources<'_>, tokenizer: &dyn Tokenizer) -> Usage {
    let mut usage = sources.reported.unwrap_or_default();

    if usage.completion_tokens == 0 {
        usage.completion_tokens = estimate_completion(sources, tokenizer);
    }
    if usage.prompt_tokens == 0 && usage.completion_tokens != 0 {
        usage.prompt_tokens = sources.prompt_estimate;
    }
    if usage.total_tokens == 0 {
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
    }
    usage
}

fn estimate_completion(sources: &UsageSources<'_>, tokenizer: &dyn Tokenizer) -> u64 {
    let count = |text: &str| tokenizer.count_text_tokens(text, sources.model);

    if !sources.text.is_empty() {
        return count(sources.text);
    }
    for outputs in [sources.snapshot_outputs, sources.merged_outputs] {
        let extracted = extract_output_text(outputs);
        if !extracted.is_empty() {
            return count(&extracted);
        }
    }
    for outputs in [sources.snapshot_outputs, sources.merged_outputs] {
        if outputs.is_empty() {
            continue;
        }
        if let Ok(serialized) = serde_json::to_string(outputs) {
            return count(&serialized).max(1);
        }
    }
    0
}

/// Text a client would be billed for in a list of output items.
///
/// Covers `output_text` parts, refusals, reasoning summaries and function
/// call names with their arguments.
#[must_use]
pub fn extract_output_text(items: &[OutputItem]) -> String {
    let mut out = String::new();
    for item in items {
        match &item.kind {
            OutputItemKind::Message => {
                for part in &item.content {
                    out.push_str(&part.text);
                    if let Some(refusal) = &part.refusal {
                        out.push_str(refusal);
                    }
                }
            }
            OutputItemKind::Reasoning => {
                for part in item.summary.iter().chain(item.content.iter()) {
                    out.push_str(&part.text);
                }
            }
            OutputItemKind::FunctionCall => {
                out.push_str(&item.name);
                if let Some(arguments) = &item.arguments {
                    out.push_str(arguments);
                }
            }
            OutputItemKind::WebSearchCall
            | OutputItemKind::ImageGenerationCall
            | OutputItemKind::Other(_) => {}
        }
    }
    out
}

/// Visible text of a message-only output list, used for chat `content`.
#[must_use]
pub fn extract_message_text(items: &[OutputItem]) -> String {
    let mut out = String::new();
    for item in items {
        if item.kind == OutputItemKind::Message {
            for part in &item.content {
                out.push_str(&part.text);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::token_counter::HeuristicTokenizer;
    use crate::protocol::canonical::ContentPart;

    fn sources<'a>(reported: Option<Usage>, text: &'a str) -> UsageSources<'a> {
        UsageSources {
            reported,
            text,
            snapshot_outputs: &[],
            merged_outputs: &[],
            prompt_estimate: 10,
            model: "gpt-5",
        }
    }

    #[test]
    fn test_reported_usage_is_untouched() {
        let reported = Usage::new(5, 3, 8);
        let usage = reconcile(&sources(Some(reported), "ignored text"), &HeuristicTokenizer);
        assert_eq!(usage, reported);
    }

    #[test]
    fn test_estimate_fills_all_fields() {
        let usage = reconcile(&sources(None, "hello world!"), &HeuristicTokenizer);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.total_tokens, 13);
    }

    #[test]
    fn test_no_output_stays_zero() {
        let usage = reconcile(&sources(None, ""), &HeuristicTokenizer);
        assert!(usage.is_empty());
    }

    #[test]
    fn test_snapshot_text_used_before_merged() {
        let snapshot = vec![OutputItem::assistant_message(
            "m".into(),
            "assistant".into(),
            "abcdefgh",
        )];
        let merged = vec![OutputItem::assistant_message("m".into(), "assistant".into(), "a")];
        let usage = reconcile(
            &UsageSources {
                snapshot_outputs: &snapshot,
                merged_outputs: &merged,
                ..sources(None, "")
            },
            &HeuristicTokenizer,
        );
        assert_eq!(usage.completion_tokens, 2);
    }

    #[test]
    fn test_outputs_without_text_are_counted_serialized() {
        let merged = vec![OutputItem {
            kind: OutputItemKind::ImageGenerationCall,
            id: "ig_1".into(),
            ..OutputItem::default()
        }];
        let usage = reconcile(
            &UsageSources {
                merged_outputs: &merged,
                ..sources(None, "")
            },
            &HeuristicTokenizer,
        );
        assert!(usage.completion_tokens > 0);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[test]
    fn test_extract_covers_refusal_reasoning_and_calls() {
        let items = vec![
            OutputItem {
                kind: OutputItemKind::Message,
                content: vec![ContentPart {
                    kind: "refusal".into(),
                    refusal: Some("no".into()),
                    ..ContentPart::default()
                }],
                ..OutputItem::default()
            },
            OutputItem {
                kind: OutputItemKind::Reasoning,
                summary: vec![ContentPart {
                    kind: "summary_text".into(),
                    text: "why".into(),
                    ..ContentPart::default()
                }],
                ..OutputItem::default()
            },
            OutputItem::function_call("fc", "call", "f", "{}"),
        ];
        assert_eq!(extract_output_text(&items), "nowhyf{}");
    }
}

//! Merges output-item fragments and tool-call argument updates into one
//! ordered result.
use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::protocol::canonical::{OutputItem, OutputItemKind};

/// Outcome of inferring a delta from an argument update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentUpdate {
    pub delta: String,
    pub baseline: String,
}

/// Infer the delta carried by an update that may be a fragment or a full
/// snapshot.
///
/// A superstring of the previous value yields the suffix. Anything else is
/// taken verbatim and becomes the new baseline.
#[must_use]
pub fn infer_argument_delta(previous: &str, update: &str) -> ArgumentUpdate {
    let delta = update.strip_prefix(previous).unwrap_or(update);
    ArgumentUpdate {
        delta: delta.to_string(),
        baseline: update.to_string(),
    }
}

/// Merge indexed and unindexed items.
///
/// Indexed items come first in ascending index order (gaps omitted), then
/// unindexed items in arrival order.
#[must_use]
pub fn merge_outputs(
    by_index: &BTreeMap<usize, OutputItem>,
    no_index: &[OutputItem],
) -> Vec<OutputItem> {
    by_index
        .values()
        .chain(no_index.iter())
        .cloned()
        .collect()
}

/// Per-request accumulation of output items and tool calls.
#[derive(Debug, Default)]
pub struct OutputAccumulator {
    output_by_index: BTreeMap<usize, OutputItem>,
    output_no_index: Vec<OutputItem>,
    tool_call_args_by_call_id: FxHashMap<String, String>,
    tool_call_name_by_call_id: FxHashMap<String, String>,
    canonical_id_by_item_id: FxHashMap<String, String>,
    tool_index_by_call_id: FxHashMap<String, usize>,
    tool_call_order: Vec<String>,
}

impl OutputAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished output item. Indexed items are last-write-wins. A
    /// function call finished without arguments keeps the streamed ones.
    pub fn apply_item(&mut self, output_index: Option<usize>, mut item: OutputItem) {
        if item.kind == OutputItemKind::FunctionCall
            && item.arguments.as_deref().map_or(true, str::is_empty)
        {
            let streamed = self
                .tool_call_args_by_call_id
                .get(item.canonical_call_id())
                .filter(|arguments| !arguments.is_empty())
                .cloned();
            if streamed.is_some() {
                item.arguments = streamed;
            }
        }
        match output_index {
            Some(index) => {
                self.output_by_index.insert(index, item);
            }
            None => self.output_no_index.push(item),
        }
    }

    /// Final output list. A non-empty snapshot list wins outright.
    #[must_use]
    pub fn finalize(&self, snapshot_output: Option<&[OutputItem]>) -> Vec<OutputItem> {
        match snapshot_output {
            Some(output) if !output.is_empty() => output.to_vec(),
            _ => merge_outputs(&self.output_by_index, &self.output_no_index),
        }
    }

    /// Resolve an item id or call id to the canonical call id.
    #[must_use]
    pub fn resolve_call_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.canonical_id_by_item_id
            .get(id)
            .map_or(id, String::as_str)
    }

    /// Register a function-call item seen in `output_item.added/done`.
    ///
    /// Returns the canonical call id and the argument delta inferred from the
    /// item's argument snapshot. Other item kinds return `None`.
    pub fn register_function_call(&mut self, item: &OutputItem) -> Option<(String, ArgumentUpdate)> {
        if item.kind != OutputItemKind::FunctionCall {
            return None;
        }
        let call_id = item.canonical_call_id().to_string();
        if call_id.is_empty() {
            return None;
        }
        let item_id = item.id.trim();
        if !item_id.is_empty() {
            self.canonical_id_by_item_id
                .insert(item_id.to_string(), call_id.clone());
        }
        if !item.name.is_empty() {
            self.tool_call_name_by_call_id
                .insert(call_id.clone(), item.name.clone());
        }
        self.tool_index(&call_id);
        let update = self.apply_arguments_snapshot(&call_id, item.arguments.as_deref().unwrap_or(""));
        Some((call_id, update))
    }

    /// Apply a snapshot-bearing argument update (inference mode). An empty
    /// snapshot carries no information and leaves the baseline alone.
    pub fn apply_arguments_snapshot(&mut self, id: &str, value: &str) -> ArgumentUpdate {
        let call_id = self.resolve_call_id(id).to_string();
        let previous = self
            .tool_call_args_by_call_id
            .get(&call_id)
            .map_or("", String::as_str);
        if value.is_empty() {
            return ArgumentUpdate {
                delta: String::new(),
                baseline: previous.to_string(),
            };
        }
        let update = infer_argument_delta(previous, value);
        self.tool_call_args_by_call_id
            .insert(call_id, update.baseline.clone());
        update
    }

    /// Append a known fragment and return the canonical call id.
    pub fn append_arguments_fragment(&mut self, id: &str, fragment: &str) -> String {
        let call_id = self.resolve_call_id(id).to_string();
        self.tool_index(&call_id);
        self.tool_call_args_by_call_id
            .entry(call_id.clone())
            .or_default()
            .push_str(fragment);
        call_id
    }

    /// Stable zero-based index for a call, allocated on first sight.
    pub fn tool_index(&mut self, call_id: &str) -> usize {
        if let Some(index) = self.tool_index_by_call_id.get(call_id) {
            return *index;
        }
        let index = self.tool_call_order.len();
        self.tool_call_order.push(call_id.to_string());
        self.tool_index_by_call_id.insert(call_id.to_string(), index);
        index
    }

    #[must_use]
    pub fn is_known_call(&self, call_id: &str) -> bool {
        self.tool_index_by_call_id.contains_key(call_id)
    }

    #[must_use]
    pub fn tool_name(&self, call_id: &str) -> Option<&str> {
        self.tool_call_name_by_call_id
            .get(call_id)
            .map(String::as_str)
    }

    #[must_use]
    pub fn tool_arguments(&self, call_id: &str) -> Option<&str> {
        self.tool_call_args_by_call_id
            .get(call_id)
            .map(String::as_str)
    }

    /// Tool calls as `(call_id, name, arguments)` in first-seen order.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &str)> + '_ {
        self.tool_call_order.iter().map(move |call_id| {
            (
                call_id.as_str(),
                self.tool_name(call_id).unwrap_or_default(),
                self.tool_arguments(call_id).unwrap_or_default(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> OutputItem {
        OutputItem::assistant_message(id.to_string(), "assistant".to_string(), id)
    }

    #[test]
    fn test_indexed_then_unindexed_with_gaps() {
        let mut acc = OutputAccumulator::new();
        acc.apply_item(None, message("u1"));
        acc.apply_item(Some(3), message("i3"));
        acc.apply_item(Some(0), message("i0"));
        acc.apply_item(None, message("u2"));
        let ids: Vec<String> = acc.finalize(None).into_iter().map(|item| item.id).collect();
        assert_eq!(ids, vec!["i0", "i3", "u1", "u2"]);
    }

    #[test]
    fn test_indexed_last_write_wins() {
        let mut acc = OutputAccumulator::new();
        acc.apply_item(Some(0), message("first"));
        acc.apply_item(Some(0), message("second"));
        let output = acc.finalize(None);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].id, "second");
    }

    #[test]
    fn test_snapshot_wins_outright() {
        let mut acc = OutputAccumulator::new();
        acc.apply_item(Some(0), message("delta_only"));
        let snapshot = vec![message("snap")];
        let output = acc.finalize(Some(&snapshot));
        assert_eq!(output, snapshot);
        assert_eq!(acc.finalize(Some(&[])).len(), 1);
    }

    #[test]
    fn test_identical_snapshot_twice_yields_empty_delta() {
        let mut acc = OutputAccumulator::new();
        let first = acc.apply_arguments_snapshot("call_1", "{\"q\":1}");
        assert_eq!(first.delta, "{\"q\":1}");
        let second = acc.apply_arguments_snapshot("call_1", "{\"q\":1}");
        assert_eq!(second.delta, "");
    }

    #[test]
    fn test_non_superstring_update_is_verbatim_and_new_baseline() {
        let mut acc = OutputAccumulator::new();
        acc.apply_arguments_snapshot("call_1", "{\"q\":");
        let update = acc.apply_arguments_snapshot("call_1", "\"x\"}");
        assert_eq!(update.delta, "\"x\"}");
        assert_eq!(update.baseline, "\"x\"}");
        assert_eq!(acc.tool_arguments("call_1"), Some("\"x\"}"));
    }

    #[test]
    fn test_growing_snapshot_yields_suffix() {
        let update = infer_argument_delta("{\"q\":", "{\"q\":\"x\"}");
        assert_eq!(update.delta, "\"x\"}");
    }

    #[test]
    fn test_item_id_resolves_to_call_id() {
        let mut acc = OutputAccumulator::new();
        let item = OutputItem::function_call("fc_1", "call_1", "lookup", "");
        let (call_id, update) = acc.register_function_call(&item).unwrap();
        assert_eq!(call_id, "call_1");
        assert_eq!(update.delta, "");
        assert_eq!(acc.append_arguments_fragment("fc_1", "{\"q\":"), "call_1");
        acc.append_arguments_fragment("fc_1", "\"x\"}");
        assert_eq!(acc.tool_arguments("call_1"), Some("{\"q\":\"x\"}"));
        assert_eq!(acc.tool_index("call_1"), 0);
        assert_eq!(acc.tool_index("call_2"), 1);
        let calls: Vec<_> = acc.tool_calls().collect();
        assert_eq!(calls[0], ("call_1", "lookup", "{\"q\":\"x\"}"));
    }

    #[test]
    fn test_done_snapshot_after_fragments_adds_nothing() {
        let mut acc = OutputAccumulator::new();
        acc.register_function_call(&OutputItem::function_call("fc_1", "call_1", "f", ""));
        acc.append_arguments_fragment("fc_1", "{\"a\":");
        acc.append_arguments_fragment("fc_1", "1}");
        let update = acc.apply_arguments_snapshot("fc_1", "{\"a\":1}");
        assert_eq!(update.delta, "");
    }

    #[test]
    fn test_empty_snapshot_keeps_streamed_arguments() {
        let mut acc = OutputAccumulator::new();
        acc.register_function_call(&OutputItem::function_call("fc_1", "call_1", "f", ""));
        acc.append_arguments_fragment("fc_1", "{\"a\":1}");
        let update = acc.apply_arguments_snapshot("fc_1", "");
        assert_eq!(update.delta, "");
        assert_eq!(update.baseline, "{\"a\":1}");

        let mut finished = OutputItem::function_call("fc_1", "call_1", "f", "");
        finished.arguments = None;
        acc.register_function_call(&finished);
        acc.apply_item(Some(0), finished);
        assert_eq!(acc.tool_arguments("call_1"), Some("{\"a\":1}"));
        assert_eq!(acc.finalize(None)[0].arguments.as_deref(), Some("{\"a\":1}"));
    }
}

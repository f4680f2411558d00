//! Reassembly of streamed tool-call fragments.

use crate::providers::{ToolCall, ToolCallDelta};

/// One tool call being rebuilt from stream fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallAccumulator {
    index: u32,
    id: Option<String>,
    kind: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Merge a fragment. Identity fields are set once; arguments append.
    pub fn apply(&mut self, delta: &ToolCallDelta) {
        if self.id.is_none() {
            self.id = delta.id.clone();
        }
        if self.kind.is_none() {
            self.kind = delta.kind.clone();
        }
        if self.name.is_none() {
            self.name = delta.name.clone();
        }
        if let Some(fragment) = &delta.arguments {
            self.arguments.push_str(fragment);
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// A call is dispatchable once it has an id and a name.
    pub fn is_complete(&self) -> bool {
        self.id.is_some() && self.name.is_some()
    }

    pub fn finish(self) -> Option<ToolCall> {
        let id = self.id?;
        let name = self.name?;
        Some(ToolCall {
            id,
            kind: self.kind.unwrap_or_else(|| "function".to_string()),
            name,
            arguments: self.arguments,
        })
    }
}

/// Routes fragments of a whole stream to their accumulators.
///
/// Fragments are matched by call id when present, otherwise by stream index,
/// otherwise they continue the most recently opened call.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: Vec<ToolCallAccumulator>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, delta: &ToolCallDelta) {
        let slot = match &delta.id {
            Some(id) => self
                .calls
                .iter()
                .position(|c| c.id() == Some(id.as_str()))
                .or_else(|| {
                    self.calls
                        .iter()
                        .position(|c| c.id().is_none() && c.index() == delta.index)
                }),
            None => self
                .calls
                .iter()
                .rposition(|c| c.index() == delta.index)
                .or_else(|| self.calls.len().checked_sub(1)),
        };

        match slot {
            Some(pos) => self.calls[pos].apply(delta),
            None => {
                let mut call = ToolCallAccumulator::new(delta.index);
                call.apply(delta);
                self.calls.push(call);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completed calls in first-seen order. Fragments that never received an
    /// id or name are dropped.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter_map(ToolCallAccumulator::finish)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(String::from),
            kind: id.map(|_| "function".to_string()),
            name: name.map(String::from),
            arguments: Some(args.to_string()),
        }
    }

    #[test]
    fn arguments_concatenate_across_chunks_for_same_id() {
        let mut assembler = ToolCallAssembler::new();
        assembler.apply(&delta(0, Some("tc1"), Some("calc"), "{\"x\":"));
        assembler.apply(&delta(0, Some("tc1"), None, "1}"));

        let calls = assembler.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tc1");
        assert_eq!(calls[0].arguments, "{\"x\":1}");
    }

    #[test]
    fn continuation_without_id_follows_index() {
        let mut assembler = ToolCallAssembler::new();
        assembler.apply(&delta(0, Some("a"), Some("first"), "{"));
        assembler.apply(&delta(1, Some("b"), Some("second"), "{"));
        assembler.apply(&delta(0, None, None, "}"));
        assembler.apply(&delta(1, None, None, "\"k\":2}"));

        let calls = assembler.finish();
        assert_eq!(calls[0].arguments, "{}");
        assert_eq!(calls[1].arguments, "{\"k\":2}");
    }

    #[test]
    fn incomplete_fragments_are_dropped() {
        let mut acc = ToolCallAccumulator::new(0);
        acc.apply(&delta(0, None, None, "{}"));
        assert!(!acc.is_complete());
        assert!(acc.finish().is_none());
    }
}

//! Regex-grade extraction of critical information from a conversation's
//! discarded middle section during compaction (spec.md §4.3).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    ToolCall,
    ToolResult,
    MemoryOp,
    Error,
    Decision,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::ToolCall => "tool calls",
            Category::ToolResult => "tool results",
            Category::MemoryOp => "memory operations",
            Category::Error => "errors",
            Category::Decision => "key decisions",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extracted {
    pub category: Category,
    pub text: String,
}

static TOOL_CALL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"TOOL_CALL:\s*(\S+)").unwrap());
static TOOL_RESULT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Act #(\d+)\s*→\s*(\S+)\s+(.+)").unwrap());
static MEMORY_OP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(WriteFile|CreateTool|LoadModule)\b").unwrap());
static DECISION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Think #(\d+)\n(.+)").unwrap());

/// Extracts all recognizable critical items from one message's content.
pub fn extract_from_message(message: &Message) -> Vec<Extracted> {
    let mut out = Vec::new();
    let content = &message.content;

    for cap in TOOL_CALL_RE.captures_iter(content) {
        out.push(Extracted {
            category: Category::ToolCall,
            text: format!("TOOL_CALL: {}", &cap[1]),
        });
    }
    for cap in TOOL_RESULT_RE.captures_iter(content) {
        out.push(Extracted {
            category: Category::ToolResult,
            text: format!("Act #{} → {} {}", &cap[1], &cap[2], &cap[3]),
        });
    }
    if MEMORY_OP_RE.is_match(content) {
        for cap in MEMORY_OP_RE.captures_iter(content) {
            out.push(Extracted {
                category: Category::MemoryOp,
                text: cap[1].to_string(),
            });
        }
    }
    if content.contains("ERROR") || content.contains("failed") || content.contains("Error:") {
        out.push(Extracted {
            category: Category::Error,
            text: first_line_containing_any(content, &["ERROR", "failed", "Error:"]),
        });
    }
    for cap in DECISION_RE.captures_iter(content) {
        out.push(Extracted {
            category: Category::Decision,
            text: format!("Think #{}: {}", &cap[1], &cap[2]),
        });
    }

    let _ = message.role; // extraction is content-driven, role is incidental
    out
}

fn first_line_containing_any(text: &str, needles: &[&str]) -> String {
    text.lines()
        .find(|line| needles.iter().any(|n| line.contains(n)))
        .unwrap_or(text)
        .trim()
        .to_string()
}

/// Categories in the fixed priority order the synthesis groups by.
pub const CATEGORY_ORDER: [Category; 5] = [
    Category::ToolCall,
    Category::ToolResult,
    Category::MemoryOp,
    Category::Error,
    Category::Decision,
];

/// Builds the synthetic summary message replacing a compacted middle
/// section: groups by category, keeps the N most recent per category
/// (aggressive mode uses tighter caps), prepends the compaction banner.
pub fn synthesize(items: &[Extracted], keep_per_category: usize, per_item_char_cap: usize, aggressive: bool) -> String {
    let mode = if aggressive { "AGGRESSIVE" } else { "STANDARD" };
    let mut sections = Vec::new();
    for category in CATEGORY_ORDER {
        let mut matching: Vec<&Extracted> = items.iter().filter(|i| i.category == category).collect();
        if matching.is_empty() {
            continue;
        }
        // "most recent" = last in document order
        let start = matching.len().saturating_sub(keep_per_category);
        matching = matching.split_off(start);
        let lines: Vec<String> = matching
            .iter()
            .map(|i| truncate_chars(&i.text, per_item_char_cap))
            .collect();
        sections.push(format!("{}:\n{}", category.label(), lines.join("\n")));
    }
    format!("[CONTEXT COMPACTED - {mode}]\n{}", sections.join("\n\n"))
}

fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(cap).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tool_call_and_result() {
        let msg = Message::assistant("TOOL_CALL: Grep\nARGS: {}\nAct #3 → Grep found 2 matches");
        let items = extract_from_message(&msg);
        assert!(items.iter().any(|i| matches!(i.category, Category::ToolCall)));
        assert!(items.iter().any(|i| matches!(i.category, Category::ToolResult)));
    }

    #[test]
    fn extracts_errors_and_decisions() {
        let msg = Message::user("ERROR: disk full\nThink #1\nswitch to compaction");
        let items = extract_from_message(&msg);
        assert!(items.iter().any(|i| matches!(i.category, Category::Error)));
        assert!(items.iter().any(|i| matches!(i.category, Category::Decision)));
    }

    #[test]
    fn synthesis_prepends_mode_banner() {
        let items = vec![Extracted {
            category: Category::Error,
            text: "boom".into(),
        }];
        let out = synthesize(&items, 3, 100, true);
        assert!(out.starts_with("[CONTEXT COMPACTED - AGGRESSIVE]"));
    }
}

//! Tool-call extraction: native (`LLMResponse.toolCalls`) and text-based
//! (`TOOL_CALL: <Name>\nARGS: <json>`) wire formats (spec.md §6). Shared by
//! the Agent Loop and the Worker Manager's per-iteration dispatch so both
//! honor "native first, else text-parsed" identically.

use serde_json::Value;

use crate::llm::LLMResponse;

/// One parsed call plus its position in the original LLM response, so a
/// caller that executes read-only calls concurrently can still restore the
/// model's emission order in the transcript (spec.md §5, property P8).
#[derive(Debug, Clone)]
pub struct ParsedCall {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
}

/// Native tool calls win when present; otherwise falls back to scanning
/// the assistant's text content for the `TOOL_CALL:`/`ARGS:` wire format.
pub fn extract_tool_calls(response: &LLMResponse) -> Vec<ParsedCall> {
    if let Some(native) = &response.tool_calls {
        if !native.is_empty() {
            return native
                .iter()
                .enumerate()
                .map(|(index, call)| ParsedCall {
                    index,
                    id: Some(call.id.clone()),
                    name: call.name.clone(),
                    args: call.args.clone(),
                })
                .collect();
        }
    }
    parse_text_tool_calls(&response.content)
}

/// `TOOL_CALL: <Name>\nARGS: <json>` (spec.md §6). The JSON payload may
/// span multiple lines, so its extent is found by brace matching rather
/// than a line boundary.
pub fn parse_text_tool_calls(content: &str) -> Vec<ParsedCall> {
    let mut out = Vec::new();
    const MARKER: &str = "TOOL_CALL:";
    let mut search_from = 0usize;
    let mut index = 0usize;

    while let Some(rel) = content[search_from..].find(MARKER) {
        let name_start = search_from + rel + MARKER.len();
        let rest = &content[name_start..];
        let name_end = rest.find('\n').unwrap_or(rest.len());
        let name = rest[..name_end].trim().to_string();

        if name.is_empty() {
            search_from = name_start;
            continue;
        }

        let after_name = &rest[name_end..];
        let Some(args_marker_rel) = after_name.find("ARGS:") else {
            search_from = name_start + name_end;
            continue;
        };
        let args_region = &after_name[args_marker_rel + "ARGS:".len()..];

        match extract_json_object(args_region) {
            Some((args_text, consumed)) => {
                if let Ok(args) = serde_json::from_str::<Value>(&args_text) {
                    out.push(ParsedCall { index, id: None, name, args });
                    index += 1;
                }
                search_from = name_start + name_end + args_marker_rel + "ARGS:".len() + consumed;
            }
            None => {
                search_from = name_start + name_end + args_marker_rel + "ARGS:".len();
            }
        }
    }
    out
}

/// Scans forward from the first `{` to its matching `}`, respecting
/// string literals, and returns the matched slice plus bytes consumed.
fn extract_json_object(text: &str) -> Option<(String, usize)> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string: Option<u8> = None;
    let mut i = start;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(quote) = in_string {
            if c == b'\\' {
                i += 2;
                continue;
            } else if c == quote {
                in_string = None;
            }
        } else {
            match c {
                b'"' | b'\'' => in_string = Some(c),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((text[start..=i].to_string(), i + 1));
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::NativeToolCall;

    #[test]
    fn parses_single_text_tool_call() {
        let content = "TOOL_CALL: AddNumbers\nARGS: {\"a\": 1, \"b\": 2}\n";
        let calls = parse_text_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "AddNumbers");
        assert_eq!(calls[0].args["a"], 1);
    }

    #[test]
    fn parses_multiple_text_tool_calls_in_order() {
        let content = "TOOL_CALL: ReadFile\nARGS: {\"path\": \"/a\"}\nTOOL_CALL: Grep\nARGS: {\"pattern\": \"x\"}\n";
        let calls = parse_text_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "ReadFile");
        assert_eq!(calls[1].name, "Grep");
    }

    #[test]
    fn multiline_json_args_are_captured_by_brace_matching() {
        let content = "TOOL_CALL: WriteFile\nARGS: {\n  \"path\": \"/tools/X.js\",\n  \"content\": \"a\"\n}\n";
        let calls = parse_text_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args["path"], "/tools/X.js");
    }

    #[test]
    fn native_tool_calls_take_precedence_over_text() {
        let response = LLMResponse {
            content: "TOOL_CALL: Ignored\nARGS: {}".into(),
            tool_calls: Some(vec![NativeToolCall {
                id: "1".into(),
                name: "ReadFile".into(),
                args: serde_json::json!({}),
            }]),
            usage: None,
        };
        let calls = extract_tool_calls(&response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "ReadFile");
    }

    #[test]
    fn falls_back_to_text_when_no_native_calls() {
        let response = LLMResponse {
            content: "TOOL_CALL: ReadFile\nARGS: {\"path\": \"/a\"}".into(),
            tool_calls: None,
            usage: None,
        };
        let calls = extract_tool_calls(&response);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn no_tool_calls_yields_empty_list() {
        let response = LLMResponse { content: "all done, no more actions needed".into(), tool_calls: None, usage: None };
        assert!(extract_tool_calls(&response).is_empty());
    }
}

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use talon_core::types::ToolCall;

const OPEN_TAG: &str = "[tool_call]";
const CLOSE_TAG: &str = "[/tool_call]";

/// Body of one `[tool_call]…[/tool_call]` block.
#[derive(Debug, Deserialize)]
struct RawCall {
    tool: String,
    #[serde(default)]
    args: HashMap<String, String>,
}

/// Extract tool calls from an LLM response.
///
/// Scans for non-overlapping `[tool_call]…[/tool_call]` blocks; the body is
/// `{"tool":"plugin.action","args":{…}}` and the tool name splits on the
/// last dot. Malformed blocks are skipped. An empty result means the
/// response is the final answer. Ids are synthesized `call-1`, `call-2`, …
/// in encounter order.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(OPEN_TAG) {
        let after_open = &rest[start + OPEN_TAG.len()..];
        let Some(end) = after_open.find(CLOSE_TAG) else {
            break;
        };
        let body = &after_open[..end];
        rest = &after_open[end + CLOSE_TAG.len()..];

        match serde_json::from_str::<RawCall>(body.trim()) {
            Ok(raw) => match split_tool_name(&raw.tool) {
                Some((plugin, action)) => {
                    calls.push(ToolCall {
                        id: format!("call-{}", calls.len() + 1),
                        plugin: plugin.to_string(),
                        action: action.to_string(),
                        args: raw.args,
                    });
                }
                None => debug!(tool = %raw.tool, "skipping tool call without plugin.action form"),
            },
            Err(e) => debug!(error = %e, "skipping malformed tool call block"),
        }
    }

    calls
}

/// `"a.b.c"` → `("a.b", "c")`: the action is everything after the last dot.
fn split_tool_name(tool: &str) -> Option<(&str, &str)> {
    let pos = tool.rfind('.')?;
    let (plugin, action) = (&tool[..pos], &tool[pos + 1..]);
    if plugin.is_empty() || action.is_empty() {
        return None;
    }
    Some((plugin, action))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_blocks_means_final_answer() {
        assert!(parse_tool_calls("The code looks good!").is_empty());
    }

    #[test]
    fn single_block_is_extracted() {
        let text = r#"Let me check. [tool_call]{"tool":"gitlab.analyze_code","args":{"repo":"myrepo"}}[/tool_call]"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call-1");
        assert_eq!(calls[0].plugin, "gitlab");
        assert_eq!(calls[0].action, "analyze_code");
        assert_eq!(calls[0].args["repo"], "myrepo");
    }

    #[test]
    fn multiple_blocks_number_in_encounter_order() {
        let text = concat!(
            r#"[tool_call]{"tool":"gitlab.analyze_code"}[/tool_call]"#,
            " and ",
            r#"[tool_call]{"tool":"jira.create_issue"}[/tool_call]"#,
        );
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call-1");
        assert_eq!(calls[1].id, "call-2");
        assert_eq!(calls[1].plugin, "jira");
    }

    #[test]
    fn tool_name_splits_on_last_dot() {
        let text = r#"[tool_call]{"tool":"com.example.tools.run"}[/tool_call]"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls[0].plugin, "com.example.tools");
        assert_eq!(calls[0].action, "run");
    }

    #[test]
    fn malformed_blocks_are_skipped_not_fatal() {
        let text = concat!(
            r#"[tool_call]not json at all[/tool_call]"#,
            r#"[tool_call]{"tool":"nodot"}[/tool_call]"#,
            r#"[tool_call]{"tool":"jira.create_issue"}[/tool_call]"#,
        );
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call-1");
        assert_eq!(calls[0].plugin, "jira");
    }

    #[test]
    fn unterminated_block_stops_the_scan() {
        let text = r#"[tool_call]{"tool":"gitlab.analyze_code"}"#;
        assert!(parse_tool_calls(text).is_empty());
    }
}

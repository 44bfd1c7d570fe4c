//! Extraction of the embedded call-control directive from a model reply.
//!
//! The model is instructed to append a JSON block (fenced, or bare at the
//! very end) when it wants the call ended. Parsing is deliberately
//! conservative: a block that does not parse as JSON is treated as absent
//! and the full text is spoken; a block that parses is always stripped from
//! the spoken text, whatever its action.

use serde::Deserialize;
use tracing::{debug, warn};

/// A structured instruction embedded at the end of a reply.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CallDirective {
    /// Requested action; `"hangup"` ends the call.
    pub action: String,
    /// Model-provided rationale, logged only.
    #[serde(default)]
    pub reason: Option<String>,
}

impl CallDirective {
    /// Whether this directive requests ending the call.
    pub fn is_hangup(&self) -> bool {
        self.action == "hangup"
    }
}

/// Split a reply into spoken text and an optional directive.
///
/// Pass one looks for a ```` ```json ```` fenced block; pass two falls back
/// to a bare JSON object at the end of the text.
pub fn extract_directive(reply: &str) -> (String, Option<CallDirective>) {
    if let Some((spoken, directive)) = extract_fenced(reply) {
        debug!("directive from fenced block: {directive:?}");
        return (spoken, Some(directive));
    }
    if let Some((spoken, directive)) = extract_bare_trailing(reply) {
        debug!("directive from trailing object: {directive:?}");
        return (spoken, Some(directive));
    }
    (reply.trim().to_owned(), None)
}

fn extract_fenced(reply: &str) -> Option<(String, CallDirective)> {
    let fence_start = reply.find("```json")?;
    let inner_start = fence_start + "```json".len();
    let inner_len = reply[inner_start..].find("```")?;
    let inner = &reply[inner_start..inner_start + inner_len];
    let fence_end = inner_start + inner_len + "```".len();

    let directive = parse_object(inner).or_else(|| {
        warn!("fenced block is not a valid directive; speaking full text");
        None
    })?;

    let mut spoken = String::with_capacity(reply.len());
    spoken.push_str(&reply[..fence_start]);
    spoken.push_str(&reply[fence_end..]);
    Some((spoken.trim().to_owned(), directive))
}

fn extract_bare_trailing(reply: &str) -> Option<(String, CallDirective)> {
    let trimmed = reply.trim_end();
    if !trimmed.ends_with('}') {
        return None;
    }
    // Walk back to the matching opening brace.
    let mut depth = 0_i32;
    let mut start = None;
    for (i, c) in trimmed.char_indices().rev() {
        match c {
            '}' => depth += 1,
            '{' => {
                depth -= 1;
                if depth == 0 {
                    start = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let start = start?;
    let directive = parse_object(&trimmed[start..])?;
    Some((trimmed[..start].trim().to_owned(), directive))
}

fn parse_object(text: &str) -> Option<CallDirective> {
    let text = text.trim();
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_is_stripped_and_flagged() {
        let reply = "Goodbye! Have a nice day.\n```json\n{\"action\": \"hangup\", \"reason\": \"user said goodbye\"}\n```";
        let (spoken, directive) = extract_directive(reply);
        assert_eq!(spoken, "Goodbye! Have a nice day.");
        let directive = directive.expect("directive");
        assert!(directive.is_hangup());
        assert_eq!(directive.reason.as_deref(), Some("user said goodbye"));
        assert!(!spoken.contains("json"));
        assert!(!spoken.contains('{'));
    }

    #[test]
    fn bare_trailing_object_is_detected() {
        let reply = "Thanks for calling, bye!\n{\"action\": \"hangup\"}";
        let (spoken, directive) = extract_directive(reply);
        assert_eq!(spoken, "Thanks for calling, bye!");
        assert!(directive.expect("directive").is_hangup());
    }

    #[test]
    fn plain_reply_is_spoken_in_full() {
        let reply = "The office opens at nine tomorrow.";
        let (spoken, directive) = extract_directive(reply);
        assert_eq!(spoken, reply);
        assert!(directive.is_none());
    }

    #[test]
    fn malformed_json_falls_back_to_full_text() {
        let reply = "Sure thing.\n{\"action\": hangup oops";
        let (spoken, directive) = extract_directive(reply);
        assert_eq!(spoken, reply.trim());
        assert!(directive.is_none());
    }

    #[test]
    fn malformed_fenced_block_falls_back_to_bare_scan_then_full_text() {
        let reply = "Okay.\n```json\nnot json at all\n```";
        let (spoken, directive) = extract_directive(reply);
        assert!(directive.is_none());
        assert_eq!(spoken, reply.trim());
    }

    #[test]
    fn non_hangup_action_is_stripped_but_not_fatal() {
        let reply = "One moment.\n```json\n{\"action\": \"transfer\"}\n```";
        let (spoken, directive) = extract_directive(reply);
        assert_eq!(spoken, "One moment.");
        let directive = directive.expect("directive");
        assert!(!directive.is_hangup());
    }

    #[test]
    fn braces_mid_sentence_do_not_trigger() {
        let reply = "Set {name} to your value.";
        let (spoken, directive) = extract_directive(reply);
        assert_eq!(spoken, reply);
        assert!(directive.is_none());
    }

    #[test]
    fn json_object_missing_action_is_ignored() {
        let reply = "Done.\n{\"note\": \"no action key\"}";
        let (spoken, directive) = extract_directive(reply);
        assert!(directive.is_none());
        assert_eq!(spoken, reply.trim());
    }
}

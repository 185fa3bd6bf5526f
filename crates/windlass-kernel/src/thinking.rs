//! Splitting `<think>…</think>` reasoning blocks out of generated text.
//!
//! Three shapes occur in the wild: properly closed tags (possibly
//! several), an unclosed trailing `<think>`, and an orphan `</think>`
//! with no opening tag at all. Some model families omit the opening tag,
//! in which case everything before the close is reasoning.

use std::sync::OnceLock;

use regex::Regex;

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("static regex"))
}

/// The published text and the extracted reasoning of one generation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThinkingSplit {
    pub text: String,
    pub thinking: String,
}

/// Extract every reasoning block from `raw`.
///
/// The returned `text` is what goes into the message log; `thinking` is
/// the concatenation of the extracted blocks.
pub fn split_thinking(raw: &str) -> ThinkingSplit {
    if !raw.contains(OPEN_TAG) {
        if let Some(idx) = raw.find(CLOSE_TAG) {
            return ThinkingSplit {
                text: raw[idx + CLOSE_TAG.len()..].trim().to_owned(),
                thinking: raw[..idx].trim().to_owned(),
            };
        }
        return ThinkingSplit {
            text: raw.trim().to_owned(),
            thinking: String::new(),
        };
    }

    let mut blocks: Vec<String> = Vec::new();
    let cleaned = think_re()
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let block = caps[1].trim().to_owned();
            if !block.is_empty() {
                blocks.push(block);
            }
            ""
        })
        .into_owned();

    // An opening tag that survived the regex has no matching close.
    let text = match cleaned.find(OPEN_TAG) {
        Some(idx) => {
            let trailing = cleaned[idx + OPEN_TAG.len()..].trim();
            if !trailing.is_empty() {
                blocks.push(trailing.to_owned());
            }
            cleaned[..idx].to_owned()
        }
        None => cleaned,
    };

    ThinkingSplit {
        text: text.trim().to_owned(),
        thinking: blocks.join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let split = split_thinking("Just an answer.");
        assert_eq!(split.text, "Just an answer.");
        assert!(split.thinking.is_empty());
    }

    #[test]
    fn closed_block_is_extracted() {
        let split = split_thinking("<think>step one\nstep two</think>The answer is 4.");
        assert_eq!(split.text, "The answer is 4.");
        assert_eq!(split.thinking, "step one\nstep two");
    }

    #[test]
    fn multiple_blocks_concatenate() {
        let split = split_thinking("<think>a</think>mid<think>b</think> end");
        assert_eq!(split.text, "mid end");
        assert_eq!(split.thinking, "a\nb");
    }

    #[test]
    fn unclosed_trailing_tag_is_thinking() {
        let split = split_thinking("Visible part.<think>half-finished reasoning");
        assert_eq!(split.text, "Visible part.");
        assert_eq!(split.thinking, "half-finished reasoning");
    }

    #[test]
    fn orphan_close_treats_prefix_as_thinking() {
        let split = split_thinking("silent reasoning here</think>The reply.");
        assert_eq!(split.text, "The reply.");
        assert_eq!(split.thinking, "silent reasoning here");
    }

    #[test]
    fn block_spanning_newlines_matches() {
        let split = split_thinking("<think>line1\n\nline3</think>ok");
        assert_eq!(split.text, "ok");
        assert_eq!(split.thinking, "line1\n\nline3");
    }
}

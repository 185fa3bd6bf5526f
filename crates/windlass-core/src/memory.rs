//! The memory layer's pure arithmetic: budgeted rehydration plans and
//! attachment-block stripping.
//!
//! A rehydration plan reconstructs a new session's state from a budget of
//! `context × 0.40 × 3.5` characters, allocated in priority order: the
//! system prompt always in full, then the last two turns, then document
//! context, then the narrative summary, then older turns newest-first.

use windlass_types::tokens::CHARS_PER_TOKEN;
use windlass_types::ChatMessage;

/// Fraction of the context window a rehydrated session may occupy.
const REHYDRATION_FRACTION: f64 = 0.40;
/// Share of the total budget document context may take.
const DOCUMENT_FRACTION: f64 = 0.30;

pub struct RehydrationInput<'a> {
    pub system_prompt: &'a str,
    pub recent_turns: &'a [ChatMessage],
    pub narrative: Option<&'a str>,
    pub document_context: Option<&'a str>,
}

#[derive(Clone, Debug)]
pub struct RehydrationPlan {
    /// The composed system prompt: the caller's system prompt plus the
    /// `[CONVERSATION SUMMARY]` and `[DOCUMENT CONTEXT]` sections.
    pub system_prompt: String,
    /// Turns to replay into the fresh session, in chronological order.
    pub turns: Vec<ChatMessage>,
    /// Character count underlying the token estimate.
    pub chars: usize,
}

/// Compute a budgeted rehydration plan.
pub fn plan_rehydration(input: &RehydrationInput<'_>, context_size: u32) -> RehydrationPlan {
    let total_budget =
        (f64::from(context_size) * REHYDRATION_FRACTION * CHARS_PER_TOKEN) as usize;

    // 1. The system prompt is always carried in full, even when it
    //    exhausts the budget on its own.
    let mut remaining = total_budget.saturating_sub(input.system_prompt.len());

    // 2. The last two turns share up to half of what remains.
    let split = input.recent_turns.len().saturating_sub(2);
    let (older, last_two) = input.recent_turns.split_at(split);
    let mut replay_tail: Vec<ChatMessage> = Vec::with_capacity(last_two.len());
    if !last_two.is_empty() {
        let per_turn = (remaining / 2) / last_two.len();
        for turn in last_two {
            let content = truncate_with_ellipsis(&turn.content, per_turn);
            remaining = remaining.saturating_sub(content.len());
            replay_tail.push(ChatMessage {
                role: turn.role,
                content,
            });
        }
    }

    // 3. Document context: up to 30% of the total budget, capped by what
    //    is left.
    let mut document_section = None;
    if let Some(document) = input.document_context.filter(|d| !d.is_empty()) {
        let cap = ((total_budget as f64 * DOCUMENT_FRACTION) as usize).min(remaining);
        if cap > 0 {
            let section = if document.len() > cap {
                let kept = floor_char_boundary(document, cap);
                format!(
                    "{}\n[truncated — first {} of {} chars]",
                    &document[..kept],
                    kept,
                    document.len()
                )
            } else {
                document.to_owned()
            };
            remaining = remaining.saturating_sub(section.len());
            document_section = Some(section);
        }
    }

    // 4. Narrative summary: up to two-thirds of what remains, keeping the
    //    tail (the most recent summary content).
    let mut narrative_section = None;
    if let Some(narrative) = input.narrative.filter(|n| !n.is_empty()) {
        let cap = remaining * 2 / 3;
        if cap > 0 {
            let section = if narrative.len() > cap {
                let start = ceil_char_boundary(narrative, narrative.len() - cap);
                format!("... {}", &narrative[start..])
            } else {
                narrative.to_owned()
            };
            remaining = remaining.saturating_sub(section.len());
            narrative_section = Some(section);
        }
    }

    // 5. Older turns, newest first, while each fits in full.
    let mut replay_head: Vec<ChatMessage> = Vec::new();
    for turn in older.iter().rev() {
        if turn.content.len() > remaining {
            break;
        }
        remaining -= turn.content.len();
        replay_head.push(turn.clone());
    }
    replay_head.reverse();

    let mut system_prompt = input.system_prompt.to_owned();
    if let Some(narrative) = narrative_section {
        system_prompt.push_str("\n\n[CONVERSATION SUMMARY]: ");
        system_prompt.push_str(&narrative);
    }
    if let Some(document) = document_section {
        system_prompt.push_str("\n\n[DOCUMENT CONTEXT]: ");
        system_prompt.push_str(&document);
    }

    let mut turns = replay_head;
    turns.extend(replay_tail);

    let chars = system_prompt.len() + turns.iter().map(|t| t.content.len()).sum::<usize>();
    RehydrationPlan {
        system_prompt,
        turns,
        chars,
    }
}

/// Remove `[Attached file: …]` and `[Image: …]` blocks from `text`.
///
/// A block starts at a line beginning with either marker and runs until
/// the next marker line, a blank line followed by a line starting with a
/// capital letter, or the end of the string. Idempotent; non-block
/// content is preserved.
pub fn strip_document_blocks(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    let mut skipping = false;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if is_marker_line(line) {
            skipping = true;
            i += 1;
            continue;
        }
        if skipping {
            if line.trim().is_empty() {
                let next_is_prose = lines
                    .get(i + 1)
                    .and_then(|next| next.chars().next())
                    .is_some_and(|c| c.is_ascii_uppercase());
                if next_is_prose {
                    skipping = false;
                }
            }
            i += 1;
            continue;
        }
        kept.push(line);
        i += 1;
    }

    kept.join("\n")
}

fn is_marker_line(line: &str) -> bool {
    line.starts_with("[Attached file:") || line.starts_with("[Image:")
}

fn truncate_with_ellipsis(content: &str, budget: usize) -> String {
    if content.len() <= budget {
        return content.to_owned();
    }
    let kept = floor_char_boundary(content, budget);
    format!("{}...", &content[..kept])
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_types::Role;

    fn input<'a>(
        system: &'a str,
        turns: &'a [ChatMessage],
        narrative: Option<&'a str>,
        document: Option<&'a str>,
    ) -> RehydrationInput<'a> {
        RehydrationInput {
            system_prompt: system,
            recent_turns: turns,
            narrative,
            document_context: document,
        }
    }

    #[test]
    fn system_prompt_is_always_carried_in_full() {
        let system = "s".repeat(10_000);
        let turns = vec![ChatMessage::user("hello")];
        let plan = plan_rehydration(&input(&system, &turns, None, None), 256);
        assert!(plan.system_prompt.starts_with(&system));
    }

    #[test]
    fn last_two_turns_survive_with_truncation_markers() {
        // Budget: 4096 × 0.40 × 3.5 = 5734 chars.
        let turns = vec![
            ChatMessage::user("old ".repeat(100)),
            ChatMessage::user("u".repeat(5_000)),
            ChatMessage::assistant("a".repeat(5_000)),
        ];
        let plan = plan_rehydration(&input("sys", &turns, None, None), 4096);
        let tail: Vec<_> = plan.turns.iter().rev().take(2).collect();
        assert_eq!(tail.len(), 2);
        for turn in tail {
            assert!(turn.content.ends_with("..."));
            // Each of the two shares at most a quarter of the budget.
            assert!(turn.content.len() <= 5734 / 4 + 3);
        }
    }

    #[test]
    fn document_context_is_capped_and_marked() {
        let document = "d".repeat(10_000);
        let turns: Vec<ChatMessage> = Vec::new();
        let plan = plan_rehydration(&input("sys", &turns, None, Some(&document)), 4096);
        let section = plan
            .system_prompt
            .split("[DOCUMENT CONTEXT]: ")
            .nth(1)
            .expect("document section present");
        assert!(section.contains("[truncated — first "));
        assert!(section.contains(" of 10000 chars]"));
        // 30% of 5734.
        assert!(section.len() <= 1720 + 64);
    }

    #[test]
    fn narrative_keeps_the_tail() {
        let narrative = format!("{}{}", "early ".repeat(2_000), "THE-LATEST-DECISION");
        let turns: Vec<ChatMessage> = Vec::new();
        let plan = plan_rehydration(&input("sys", &turns, Some(&narrative), None), 4096);
        let section = plan
            .system_prompt
            .split("[CONVERSATION SUMMARY]: ")
            .nth(1)
            .expect("summary section present");
        assert!(section.starts_with("... "));
        assert!(section.ends_with("THE-LATEST-DECISION"));
    }

    #[test]
    fn older_turns_fill_newest_first_while_they_fit() {
        let turns = vec![
            ChatMessage::user("A".repeat(6_000)), // oldest; does not fit
            ChatMessage::user("B".repeat(500)),
            ChatMessage::user("C".repeat(500)),
            ChatMessage::user("last1"),
            ChatMessage::assistant("last2"),
        ];
        let plan = plan_rehydration(&input("sys", &turns, None, None), 4096);
        let contents: Vec<&str> = plan.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents.len(), 4);
        assert!(contents[0].starts_with('B'));
        assert!(contents[1].starts_with('C'));
        assert_eq!(contents[2], "last1");
        assert_eq!(contents[3], "last2");
    }

    #[test]
    fn composition_orders_summary_before_document() {
        let turns: Vec<ChatMessage> = Vec::new();
        let plan = plan_rehydration(
            &input("base", &turns, Some("the summary"), Some("the document")),
            4096,
        );
        let summary_at = plan.system_prompt.find("[CONVERSATION SUMMARY]").unwrap();
        let document_at = plan.system_prompt.find("[DOCUMENT CONTEXT]").unwrap();
        assert!(plan.system_prompt.starts_with("base"));
        assert!(summary_at < document_at);
    }

    #[test]
    fn strip_removes_attachment_blocks() {
        let text = "Please look at this.\n\
                    [Attached file: report.pdf]\n\
                    raw extracted text\n\
                    more extracted text\n\
                    \n\
                    What does it mean?";
        let stripped = strip_document_blocks(text);
        assert!(stripped.contains("Please look at this."));
        assert!(stripped.contains("What does it mean?"));
        assert!(!stripped.contains("raw extracted text"));
        assert!(!stripped.contains("[Attached file"));
    }

    #[test]
    fn strip_handles_back_to_back_markers() {
        let text = "[Image: a.png]\npixels\n[Attached file: b.txt]\ncontents";
        let stripped = strip_document_blocks(text);
        assert!(stripped.is_empty());
    }

    #[test]
    fn strip_is_idempotent_and_preserves_plain_text() {
        let text = "Plain question with [brackets] mid-line.\n\nSecond paragraph.";
        let once = strip_document_blocks(text);
        assert_eq!(once, text);
        let attachment = "intro\n[Attached file: a]\nbody\n\nNext paragraph here.";
        let once = strip_document_blocks(attachment);
        assert_eq!(strip_document_blocks(&once), once);
    }

    #[test]
    fn roles_survive_the_plan() {
        let turns = vec![
            ChatMessage::user("question"),
            ChatMessage::assistant("answer"),
        ];
        let plan = plan_rehydration(&input("sys", &turns, None, None), 4096);
        assert_eq!(plan.turns[0].role, Role::User);
        assert_eq!(plan.turns[1].role, Role::Assistant);
    }
}

//! Message-log truncation ahead of a decode.
//!
//! Before sampling, the log is pruned so the estimated prompt characters
//! fit `context × 0.75 − max_tokens` tokens at the character estimate.
//! The position-0 system message is preserved; the oldest remaining turns
//! go first; pruning stops once the estimate fits or only two non-system
//! turns remain.

use windlass_types::tokens::CHARS_PER_TOKEN;
use windlass_types::{ChatMessage, Role};

/// Prune `messages` in place. Returns the number of dropped turns.
pub fn prune_messages(messages: &mut Vec<ChatMessage>, context_size: u32, max_tokens: u32) -> usize {
    let budget_tokens = (f64::from(context_size) * 0.75) - f64::from(max_tokens);
    let budget_chars = (budget_tokens * CHARS_PER_TOKEN).max(0.0) as usize;

    let keep_from = usize::from(matches!(
        messages.first(),
        Some(ChatMessage {
            role: Role::System,
            ..
        })
    ));

    let mut dropped = 0usize;
    loop {
        let total: usize = messages.iter().map(|m| m.content.len()).sum();
        if total <= budget_chars {
            break;
        }
        if messages.len() - keep_from <= 2 {
            break;
        }
        messages.remove(keep_from);
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turns(n: usize, len: usize) -> Vec<ChatMessage> {
        let mut v = vec![ChatMessage::system("sys")];
        for i in 0..n {
            let content = "x".repeat(len);
            if i % 2 == 0 {
                v.push(ChatMessage::user(content));
            } else {
                v.push(ChatMessage::assistant(content));
            }
        }
        v
    }

    #[test]
    fn fits_without_pruning() {
        let mut log = turns(4, 10);
        assert_eq!(prune_messages(&mut log, 4096, 512), 0);
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn drops_oldest_non_system_first() {
        // Budget: (256 * 0.75 − 64) * 3.5 = 448 chars; six 200-char turns,
        // so four are dropped and the two newest survive.
        let mut log = turns(6, 200);
        let second_newest = log[5].content.clone();
        let dropped = prune_messages(&mut log, 256, 64);
        assert_eq!(dropped, 4);
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].role, Role::System);
        assert_eq!(log[1].content, second_newest);
    }

    #[test]
    fn always_keeps_two_non_system_turns() {
        let mut log = turns(2, 100_000);
        prune_messages(&mut log, 256, 64);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn works_without_a_system_message() {
        let mut log = vec![
            ChatMessage::user("a".repeat(1000)),
            ChatMessage::assistant("b".repeat(1000)),
            ChatMessage::user("c".repeat(1000)),
        ];
        prune_messages(&mut log, 256, 64);
        assert_eq!(log.len(), 2);
        assert!(log[0].content.starts_with('b'));
    }
}

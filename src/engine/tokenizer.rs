// ── Merchant Memory: Token Estimation ──────────────────────────────────────
//
// Single source of truth for token estimates in prompt assembly. The memory
// core never sees the model's real tokenizer, so it estimates from character
// count at a fixed ratio (1 token ≈ 4 chars). Budgets, hard caps and
// consolidation triggers all go through this type.

use crate::atoms::constants::CHARS_PER_TOKEN;

#[derive(Debug, Clone, Copy)]
pub struct Tokenizer {
    chars_per_token: f32,
}

impl Tokenizer {
    pub fn new(chars_per_token: f32) -> Self {
        Tokenizer {
            chars_per_token: if chars_per_token > 0.0 { chars_per_token } else { CHARS_PER_TOKEN },
        }
    }

    /// Estimate tokens in `text`. Non-empty text costs at least one token.
    pub fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count();
        ((chars as f32 / self.chars_per_token).ceil() as usize).max(1)
    }

    /// Total for several pieces counted separately.
    pub fn count_all<'a, I: IntoIterator<Item = &'a str>>(&self, pieces: I) -> usize {
        pieces.into_iter().map(|p| self.count_tokens(p)).sum()
    }

    pub fn chars_per_token(&self) -> f32 {
        self.chars_per_token
    }

    /// Characters that fit in `tokens`.
    pub fn chars_for_tokens(&self, tokens: usize) -> usize {
        (tokens as f32 * self.chars_per_token) as usize
    }

    /// Cut `text` to at most `max_tokens` worth of characters, on a char
    /// boundary, preferring a word break when that loses less than half.
    /// Returns the slice and its estimated cost.
    pub fn truncate_to_budget<'a>(&self, text: &'a str, max_tokens: usize) -> (&'a str, usize) {
        let max_chars = self.chars_for_tokens(max_tokens);
        let Some((mut end, _)) = text.char_indices().nth(max_chars) else {
            return (text, self.count_tokens(text));
        };
        if let Some(space) = text[..end].rfind(char::is_whitespace) {
            if space > end / 2 {
                end = space;
            }
        }
        let cut = text[..end].trim_end();
        (cut, self.count_tokens(cut))
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Tokenizer::new(CHARS_PER_TOKEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_chars_per_token() {
        let tok = Tokenizer::default();
        assert_eq!(tok.count_tokens(""), 0);
        assert_eq!(tok.count_tokens("a"), 1);
        assert_eq!(tok.count_tokens("abcd"), 1);
        assert_eq!(tok.count_tokens("abcde"), 2);
        assert_eq!(tok.count_tokens(&"x".repeat(4000)), 1000);
        assert_eq!(tok.chars_for_tokens(2000), 8000);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let tok = Tokenizer::default();
        assert_eq!(tok.count_tokens("咖啡咖啡"), 1);
    }

    #[test]
    fn truncate_is_noop_when_it_fits() {
        let tok = Tokenizer::default();
        assert_eq!(tok.truncate_to_budget("short text", 10), ("short text", 3));
    }

    #[test]
    fn truncate_respects_char_limit_and_words() {
        let tok = Tokenizer::default();
        let text = "The quick brown fox jumps over the lazy dog";
        let (cut, cost) = tok.truncate_to_budget(text, 5);
        assert!(cut.chars().count() <= 20);
        assert!(cost <= 5);
        assert_eq!(cut, "The quick brown fox");
    }

    #[test]
    fn truncate_is_unicode_safe() {
        let tok = Tokenizer::default();
        let text = "深焙咖啡🌍深焙咖啡🌍深焙咖啡🌍";
        let (cut, _) = tok.truncate_to_budget(text, 1);
        assert_eq!(cut.chars().count(), 4);
    }

    #[test]
    fn bad_ratio_falls_back_to_default() {
        assert_eq!(Tokenizer::new(0.0).chars_per_token(), CHARS_PER_TOKEN);
    }
}

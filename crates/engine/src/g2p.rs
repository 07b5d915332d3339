//! Grapheme to Phoneme (G2P) Conversion for English
//!
//! Converts request text to the token sequences the synthesizer consumes.
//! Rule-based: a small exception lexicon, longest-match letter-to-sound
//! rules for common digraphs, and a per-letter fallback. A character-level
//! converter backs the retry path when the rule-based pass fails.

use async_trait::async_trait;
use std::collections::HashMap;

use lyra_core::{G2p, SpeechError, TokenSeq};

/// Phoneme inventory with stable token ids
///
/// Order is the vocabulary; ids must not change between releases because
/// primer cache keys and test fixtures depend on them.
const PHONEMES: &[&str] = &[
    "<pad>", "<sil>", "<pause>", "ə", "æ", "ɑ", "ɔ", "ɛ", "ɪ", "i", "ʊ", "u", "ʌ", "eɪ", "aɪ",
    "oʊ", "aʊ", "ɔɪ", "ɜr", "ər", "b", "d", "f", "ɡ", "h", "dʒ", "k", "l", "m", "n", "ŋ", "p",
    "r", "s", "ʃ", "t", "tʃ", "θ", "ð", "v", "w", "j", "z", "ʒ",
];

/// Tokens bracketing every utterance
const SIL: &str = "<sil>";
/// Inter-clause pause
const PAUSE: &str = "<pause>";

/// G2P configuration
#[derive(Debug, Clone)]
pub struct G2pConfig {
    /// Add silence markers at utterance edges
    pub add_silence: bool,
    /// Insert pause tokens at punctuation
    pub pause_on_punctuation: bool,
}

impl Default for G2pConfig {
    fn default() -> Self {
        Self {
            add_silence: true,
            pause_on_punctuation: true,
        }
    }
}

/// Rule-based English G2P converter
pub struct EnglishG2p {
    config: G2pConfig,
    vocab: HashMap<&'static str, i64>,
    /// Irregular words that letter-to-sound rules mangle
    lexicon: HashMap<&'static str, &'static str>,
}

impl EnglishG2p {
    pub fn new(config: G2pConfig) -> Self {
        let vocab = PHONEMES
            .iter()
            .enumerate()
            .map(|(i, p)| (*p, i as i64))
            .collect();

        let mut lexicon = HashMap::new();
        lexicon.insert("the", "ð ə");
        lexicon.insert("a", "ə");
        lexicon.insert("of", "ʌ v");
        lexicon.insert("to", "t u");
        lexicon.insert("and", "æ n d");
        lexicon.insert("you", "j u");
        lexicon.insert("one", "w ʌ n");
        lexicon.insert("two", "t u");
        lexicon.insert("was", "w ʌ z");
        lexicon.insert("are", "ɑ r");
        lexicon.insert("said", "s ɛ d");
        lexicon.insert("hello", "h ə l oʊ");
        lexicon.insert("world", "w ɜr l d");
        lexicon.insert("there", "ð ɛ r");
        lexicon.insert("their", "ð ɛ r");
        lexicon.insert("would", "w ʊ d");
        lexicon.insert("could", "k ʊ d");
        lexicon.insert("should", "ʃ ʊ d");
        lexicon.insert("once", "w ʌ n s");
        lexicon.insert("who", "h u");
        lexicon.insert("what", "w ʌ t");
        lexicon.insert("where", "w ɛ r");
        lexicon.insert("people", "p i p ə l");

        Self {
            config,
            vocab,
            lexicon,
        }
    }

    fn token(&self, phoneme: &str) -> Option<i64> {
        self.vocab.get(phoneme).copied()
    }

    /// Convert one word to phoneme symbols
    fn word_to_phonemes(&self, word: &str) -> Vec<&'static str> {
        if let Some(entry) = self.lexicon.get(word) {
            return entry.split_whitespace().map(intern).collect();
        }

        let chars: Vec<char> = word.chars().collect();
        let mut out = Vec::with_capacity(chars.len());
        let mut i = 0;

        while i < chars.len() {
            // Longest-match digraphs first
            let mut matched = false;
            for len in (2..=3).rev() {
                if i + len <= chars.len() {
                    let seq: String = chars[i..i + len].iter().collect();
                    if let Some(phoneme) = digraph_phoneme(&seq) {
                        out.push(phoneme);
                        i += len;
                        matched = true;
                        break;
                    }
                }
            }
            if matched {
                continue;
            }

            if let Some(phoneme) = single_char_phoneme(chars[i]) {
                out.push(phoneme);
            }
            i += 1;
        }
        out
    }
}

fn digraph_phoneme(seq: &str) -> Option<&'static str> {
    match seq {
        "tch" => Some("tʃ"),
        "igh" => Some("aɪ"),
        "th" => Some("θ"),
        "sh" => Some("ʃ"),
        "ch" => Some("tʃ"),
        "ph" => Some("f"),
        "wh" => Some("w"),
        "ng" => Some("ŋ"),
        "ck" => Some("k"),
        "qu" => Some("k"),
        "ee" | "ea" => Some("i"),
        "oo" => Some("u"),
        "ou" | "ow" => Some("aʊ"),
        "oi" | "oy" => Some("ɔɪ"),
        "ai" | "ay" => Some("eɪ"),
        "er" | "ir" | "ur" => Some("ər"),
        "ar" => Some("ɑ"),
        "or" => Some("ɔ"),
        _ => None,
    }
}

fn single_char_phoneme(c: char) -> Option<&'static str> {
    match c {
        'a' => Some("æ"),
        'e' => Some("ɛ"),
        'i' => Some("ɪ"),
        'o' => Some("ɑ"),
        'u' => Some("ʌ"),
        'b' => Some("b"),
        'c' | 'k' => Some("k"),
        'd' => Some("d"),
        'f' => Some("f"),
        'g' => Some("ɡ"),
        'h' => Some("h"),
        'j' => Some("dʒ"),
        'l' => Some("l"),
        'm' => Some("m"),
        'n' => Some("n"),
        'p' => Some("p"),
        'r' => Some("r"),
        's' => Some("s"),
        't' => Some("t"),
        'v' => Some("v"),
        'w' => Some("w"),
        'x' => Some("s"),
        'y' => Some("j"),
        'z' => Some("z"),
        _ => None,
    }
}

/// Map a lexicon phoneme string back to the static inventory entry
fn intern(symbol: &str) -> &'static str {
    PHONEMES
        .iter()
        .find(|p| **p == symbol)
        .copied()
        .unwrap_or("ə")
}

impl Default for EnglishG2p {
    fn default() -> Self {
        Self::new(G2pConfig::default())
    }
}

#[async_trait]
impl G2p for EnglishG2p {
    async fn to_tokens(&self, text: &str, _lang: &str) -> Result<TokenSeq, SpeechError> {
        let mut tokens: TokenSeq = Vec::new();

        if self.config.add_silence {
            tokens.push(self.token(SIL).unwrap_or(1));
        }

        for word in text.split_whitespace() {
            let trimmed: String = word
                .chars()
                .filter(|c| c.is_alphabetic() || c.is_numeric())
                .flat_map(|c| c.to_lowercase())
                .collect();

            if !trimmed.is_empty() {
                for phoneme in self.word_to_phonemes(&trimmed) {
                    if let Some(id) = self.token(phoneme) {
                        tokens.push(id);
                    }
                }
            }

            if self.config.pause_on_punctuation
                && word
                    .chars()
                    .last()
                    .is_some_and(|c| matches!(c, '.' | '!' | '?' | ',' | ';' | ':'))
            {
                tokens.push(self.token(PAUSE).unwrap_or(2));
            }
        }

        if self.config.add_silence {
            tokens.push(self.token(SIL).unwrap_or(1));
        }

        // Silence brackets alone mean nothing was convertible
        let payload = tokens.len() - if self.config.add_silence { 2 } else { 0 };
        if payload == 0 && !text.trim().is_empty() {
            return Err(SpeechError::G2pFailed(format!(
                "no phonemes for {:?}",
                text.chars().take(32).collect::<String>()
            )));
        }

        Ok(tokens)
    }
}

/// Character-level fallback converter
///
/// Maps every char to a stable token id. Never fails; used as the one retry
/// after the rule-based pass errors.
#[derive(Debug, Default)]
pub struct CharG2p;

#[async_trait]
impl G2p for CharG2p {
    async fn to_tokens(&self, text: &str, _lang: &str) -> Result<TokenSeq, SpeechError> {
        let vocab = PHONEMES.len() as i64;
        Ok(text
            .chars()
            .filter(|c| !c.is_control())
            .map(|c| (c as i64) % vocab)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_words() {
        let g2p = EnglishG2p::default();
        let tokens = g2p.to_tokens("hello world", "en-us").await.unwrap();
        assert!(tokens.len() > 4);
    }

    #[tokio::test]
    async fn test_deterministic() {
        let g2p = EnglishG2p::default();
        let a = g2p.to_tokens("The quick brown fox.", "en-us").await.unwrap();
        let b = g2p.to_tokens("The quick brown fox.", "en-us").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_punctuation_inserts_pause() {
        let g2p = EnglishG2p::default();
        let with = g2p.to_tokens("stop.", "en-us").await.unwrap();
        let without = g2p.to_tokens("stop", "en-us").await.unwrap();
        assert_eq!(with.len(), without.len() + 1);
    }

    #[tokio::test]
    async fn test_silence_brackets() {
        let g2p = EnglishG2p::default();
        let tokens = g2p.to_tokens("hi", "en-us").await.unwrap();
        assert_eq!(tokens.first(), tokens.last());
    }

    #[tokio::test]
    async fn test_unconvertible_text_fails() {
        let g2p = EnglishG2p::default();
        // No alphabetic content survives filtering
        assert!(g2p.to_tokens("—–—", "en-us").await.is_err());
    }

    #[tokio::test]
    async fn test_char_fallback_never_fails() {
        let fallback = CharG2p;
        let tokens = fallback.to_tokens("—–— 😀", "en-us").await.unwrap();
        assert!(!tokens.is_empty());
        let vocab = PHONEMES.len() as i64;
        assert!(tokens.iter().all(|t| (0..vocab).contains(t)));
    }

    #[tokio::test]
    async fn test_digraphs_collapse() {
        let g2p = EnglishG2p::default();
        // "sh" is one phoneme, not two letters
        let sh = g2p.to_tokens("sh", "en-us").await.unwrap();
        assert_eq!(sh.len(), 3); // sil + ʃ + sil
    }
}

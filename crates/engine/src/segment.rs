//! Text segmentation
//!
//! Deterministic, pure splitting of an utterance into ordered segments at
//! natural boundaries under a length cap. Paragraphs first, then sentences,
//! then grapheme-safe hard slices, then greedy repacking so no segment is
//! wastefully short when a merge fits.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use lyra_config::constants::segmenter::HARD_CAP;
use lyra_core::Segment;

/// Sentence units end at `.!?` runs; the terminator stays with its clause.
static SENTENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^.!?]*[.!?]+(?:\s+|\z)|[^.!?]+\z").expect("sentence regex"));

/// Three-or-more newlines collapse to one blank line.
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("blank-run regex"));

/// Segmenter configuration
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Per-request cap on segment length (characters)
    pub max_chars: usize,
    /// Segment 0 at or below this is primer-eligible
    pub primer_threshold: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_chars: lyra_config::constants::segmenter::MAX_CHARS,
            primer_threshold: lyra_config::constants::segmenter::PRIMER_THRESHOLD,
        }
    }
}

/// Deterministic text segmenter
#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        // The synthesizer interface never sees more than HARD_CAP chars
        let config = SegmenterConfig {
            max_chars: config.max_chars.min(HARD_CAP),
            ..config
        };
        Self { config }
    }

    /// Split `text` into ordered segments
    ///
    /// Empty (or whitespace-only) input yields an empty list; the caller
    /// completes the utterance immediately.
    pub fn segment(&self, text: &str) -> Vec<Segment> {
        let cap = self.config.max_chars;
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Vec::new();
        }

        // Paragraphs are natural pause points and always segment separately.
        // Over-cap paragraphs split into sentences, over-cap sentences
        // hard-slice, and the pieces pack back together within the paragraph.
        let mut texts: Vec<String> = Vec::new();
        for paragraph in normalized.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            if char_len(paragraph) <= cap {
                texts.push(paragraph.to_string());
                continue;
            }
            let mut units = Vec::new();
            for sentence in split_sentences(paragraph) {
                units.extend(hard_slice(&sentence, cap));
            }
            texts.extend(pack(units, cap));
        }

        let mut segments: Vec<Segment> = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Segment::new(i as u32, text))
            .collect();

        self.mark_primer(&mut segments);
        segments
    }

    /// Primer policy: a short first segment is the primer; a long utterance
    /// instead promotes its first sentence to a standalone primer segment.
    fn mark_primer(&self, segments: &mut Vec<Segment>) {
        let threshold = self.config.primer_threshold;
        let Some(first) = segments.first() else {
            return;
        };

        if first.char_len <= threshold {
            segments[0].is_primer = true;
            return;
        }

        let sentences = split_sentences(&segments[0].text);
        if sentences.len() < 2 {
            return;
        }
        let lead = sentences[0].trim_end().to_string();
        if char_len(&lead) > threshold {
            return;
        }

        let rest = segments[0].text[sentences[0].len()..].trim_start().to_string();
        let mut rebuilt = Vec::with_capacity(segments.len() + 1);
        rebuilt.push(Segment::primer(0, lead));
        rebuilt.push(Segment::new(1, rest));
        for seg in segments.iter().skip(1) {
            rebuilt.push(Segment::new(rebuilt.len() as u32, seg.text.clone()));
        }
        *segments = rebuilt;
    }
}

/// Normalize line endings, strip control characters, collapse blank-line runs
fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let cleaned: String = unified
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect();
    BLANK_RUN_RE
        .replace_all(&cleaned, "\n\n")
        .trim()
        .to_string()
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    SENTENCE_RE
        .find_iter(paragraph)
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// Slice an over-cap unit at the cap boundary without splitting grapheme
/// clusters
///
/// The cap counts chars; a cut lands on the last grapheme boundary that
/// still fits. A single grapheme wider than the cap is emitted whole.
fn hard_slice(text: &str, cap: usize) -> Vec<String> {
    let trimmed = text.trim();
    if char_len(trimmed) <= cap {
        return vec![trimmed.to_string()];
    }

    let mut out = Vec::new();
    let mut cur = String::new();
    let mut cur_chars = 0usize;
    for g in trimmed.graphemes(true) {
        let g_chars = g.chars().count();
        if cur_chars + g_chars > cap && !cur.is_empty() {
            let piece = cur.trim().to_string();
            if !piece.is_empty() {
                out.push(piece);
            }
            cur.clear();
            cur_chars = 0;
        }
        cur.push_str(g);
        cur_chars += g_chars;
    }
    let piece = cur.trim().to_string();
    if !piece.is_empty() {
        out.push(piece);
    }
    out
}

/// Greedy left-to-right packing: merge a unit into the accumulator whenever
/// the joined text still fits the cap. Greedy packing is idempotent, which
/// keeps re-segmentation of emitted segments stable.
fn pack(units: Vec<String>, cap: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut acc: Option<String> = None;

    for unit in units {
        let text = unit.trim();
        if text.is_empty() {
            continue;
        }
        match acc.take() {
            None => acc = Some(text.to_string()),
            Some(cur) => {
                if char_len(&cur) + 1 + char_len(text) <= cap {
                    acc = Some(format!("{cur} {text}"));
                } else {
                    out.push(cur);
                    acc = Some(text.to_string());
                }
            },
        }
    }
    if let Some(cur) = acc {
        out.push(cur);
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(text: &str) -> Vec<Segment> {
        Segmenter::new(SegmenterConfig::default()).segment(text)
    }

    fn seg_cap(text: &str, cap: usize) -> Vec<Segment> {
        Segmenter::new(SegmenterConfig {
            max_chars: cap,
            ..Default::default()
        })
        .segment(text)
    }

    #[test]
    fn test_empty_input() {
        assert!(seg("").is_empty());
        assert!(seg("   \n\n  ").is_empty());
    }

    #[test]
    fn test_single_character() {
        let s = seg("a");
        assert_eq!(s.len(), 1);
        assert!(s[0].is_primer);
    }

    #[test]
    fn test_short_greeting_is_one_primer_segment() {
        let s = seg("Hello, world.");
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].id, 0);
        assert!(s[0].is_primer);
    }

    #[test]
    fn test_two_paragraphs() {
        let s = seg("Para one.\n\nPara two.");
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].text, "Para one.");
        assert_eq!(s[1].text, "Para two.");
        assert_eq!((s[0].id, s[1].id), (0, 1));
    }

    #[test]
    fn test_sentences_pack_within_paragraph() {
        // Short sentences in one paragraph merge back after splitting
        let s = seg_cap("One. Two. Three. Four.", 12);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].text, "One. Two.");
        assert_eq!(s[1].text, "Three. Four.");
    }

    #[test]
    fn test_input_exactly_at_cap_is_single_segment() {
        let text = "x".repeat(1800);
        let s = seg(&text);
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].char_len, 1800);
    }

    #[test]
    fn test_cap_plus_one_splits_at_last_natural_boundary() {
        // Sentences of 1000 and 801 chars; combined 1801 > 1800
        let a = format!("{}.", "a".repeat(999));
        let b = format!("{}.", "b".repeat(800));
        let s = seg(&format!("{} {}", a, b));
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].text, a);
        assert_eq!(s[1].text, b);
    }

    #[test]
    fn test_no_terminators_over_cap_pure_hard_slices() {
        let text = "y".repeat(4000);
        let s = seg(&text);
        assert_eq!(s.len(), 3);
        assert_eq!(s[0].char_len, 1800);
        assert_eq!(s[1].char_len, 1800);
        assert_eq!(s[2].char_len, 400);
    }

    #[test]
    fn test_terminator_stays_with_clause() {
        let s = seg_cap("One. Two! Three?", 6);
        assert_eq!(s[0].text, "One.");
        assert_eq!(s[1].text, "Two!");
        assert_eq!(s[2].text, "Three?");
    }

    #[test]
    fn test_ids_are_contiguous_from_zero() {
        let text = "Sentence one is here. ".repeat(200);
        let s = seg(&text);
        for (i, segment) in s.iter().enumerate() {
            assert_eq!(segment.id, i as u32);
        }
    }

    #[test]
    fn test_long_utterance_promotes_first_sentence_to_primer() {
        // Short sentences pack into ~1800-char segments, so segment 0 is
        // well past the primer threshold until its lead sentence is promoted
        let text = "A tiny lead-in sentence here. ".repeat(100);
        let s = seg(&text);
        assert!(s.len() >= 2);
        assert!(s[0].is_primer);
        assert_eq!(s[0].text, "A tiny lead-in sentence here.");
        assert!(s[0].char_len <= 280);
        assert!(!s[1].is_primer);
    }

    #[test]
    fn test_primer_never_set_past_segment_zero() {
        let text = "A long stretch of sentences. ".repeat(300);
        for (i, segment) in seg(&text).iter().enumerate() {
            if i > 0 {
                assert!(!segment.is_primer);
            }
        }
    }

    #[test]
    fn test_control_characters_stripped() {
        let s = seg("Hel\u{0007}lo there.\u{0000}");
        assert_eq!(s[0].text, "Hello there.");
    }

    #[test]
    fn test_crlf_normalized() {
        let s = seg_cap("One.\r\n\r\nTwo.", 6);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_idempotent() {
        let texts = [
            "Hello, world.".to_string(),
            "Para one.\n\nPara two.".to_string(),
            "Sentence one is fairly long here. ".repeat(120),
            "z".repeat(4100),
        ];
        for text in texts {
            let first = seg(&text);
            let joined = first
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let second = seg(&joined);
            assert_eq!(
                first.iter().map(|s| &s.text).collect::<Vec<_>>(),
                second.iter().map(|s| &s.text).collect::<Vec<_>>(),
            );
        }
    }

    #[test]
    fn test_grapheme_safe_hard_slice() {
        // Family emoji is one grapheme of several chars; slicing at the cap
        // must never cut through it, and the cap still counts chars
        let emoji = "👨‍👩‍👧‍👦";
        let text = emoji.repeat(300);
        let cap = 100;
        let pieces = hard_slice(&text, cap);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.chars().count() <= cap);
            assert!(piece.graphemes(true).all(|g| g == emoji));
        }
    }
}

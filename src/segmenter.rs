//! Deterministic text segmentation.
//!
//! `segment` is a pure function: identical input and parameters always yield
//! an identical chunk sequence. The chunk index doubles as a cache key for
//! previously generated audio, so re-running segmentation on a document must
//! line up with audio produced on an earlier run.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_WORDS_PER_CHUNK: usize = 50;

/// A bounded unit of source text scheduled for independent synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub word_count: usize,
}

/// Tokens that end with a period without ending a sentence.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "cf", "fig",
    "no", "vol", "pp", "al", "inc", "ltd", "co",
];

/// Split text into ordered chunks of at most `max_words` words each.
///
/// Sentences are accumulated into a chunk until the next sentence would
/// exceed the bound. A single sentence longer than the bound is split on
/// word boundaries into sub-chunks of exactly `max_words` words (except the
/// last); every non-final sub-chunk gets a trailing `...` so playback order
/// stays legible. Empty or whitespace-only sentences are dropped.
pub fn segment(text: &str, max_words: usize) -> Vec<Chunk> {
    if max_words == 0 {
        return Vec::new();
    }
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current = String::new();
    let mut current_words = 0usize;

    for sentence in split_sentences(&normalized) {
        let words: Vec<&str> = sentence.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }

        // An over-long sentence becomes its own run of forced sub-chunks.
        if words.len() > max_words {
            close_chunk(&mut chunks, &mut current, &mut current_words);
            let pieces: Vec<&[&str]> = words.chunks(max_words).collect();
            let last = pieces.len() - 1;
            for (n, piece) in pieces.iter().enumerate() {
                let mut sub = piece.join(" ");
                if n < last {
                    sub.push_str("...");
                }
                push_chunk(&mut chunks, sub, piece.len());
            }
            continue;
        }

        if current_words + words.len() > max_words {
            close_chunk(&mut chunks, &mut current, &mut current_words);
        }
        if current_words > 0 {
            current.push(' ');
        }
        current.push_str(sentence);
        current_words += words.len();
    }

    close_chunk(&mut chunks, &mut current, &mut current_words);
    chunks
}

fn push_chunk(chunks: &mut Vec<Chunk>, text: String, word_count: usize) {
    let index = chunks.len();
    chunks.push(Chunk {
        index,
        text,
        word_count,
    });
}

fn close_chunk(chunks: &mut Vec<Chunk>, current: &mut String, words: &mut usize) {
    if *words == 0 {
        current.clear();
        return;
    }
    let text = std::mem::take(current);
    push_chunk(chunks, text.trim().to_string(), *words);
    *words = 0;
}

/// Collapse all whitespace runs to single spaces so extraction artifacts
/// (page breaks, double spaces) do not shift chunk boundaries between runs.
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sentence-boundary detection. A terminator (`.`, `!`, `?`) ends a sentence
/// only when it is followed by whitespace and a plausible sentence opener,
/// and, for periods, when the preceding token is neither a known
/// abbreviation nor a single initial. Decimal points and inner dots of
/// tokens like `e.g.` never sit before whitespace, so they fall out for free.
fn split_sentences(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let (dot_pos, c) = chars[i];
        if !matches!(c, '.' | '!' | '?') {
            i += 1;
            continue;
        }

        // Swallow terminator runs ("?!", "...") and trailing closers.
        let mut end = i;
        while end + 1 < chars.len()
            && matches!(
                chars[end + 1].1,
                '.' | '!' | '?' | '"' | '\'' | ')' | ']' | '\u{201d}' | '\u{2019}'
            )
        {
            end += 1;
        }

        let after = end + 1;
        if after < chars.len() && !chars[after].1.is_whitespace() {
            i = after;
            continue;
        }

        let mut j = after;
        while j < chars.len() && chars[j].1.is_whitespace() {
            j += 1;
        }
        if j >= chars.len() {
            // Terminator closes the input; the tail push below handles it.
            break;
        }

        let next = chars[j].1;
        let opens_sentence = next.is_uppercase()
            || next.is_numeric()
            || matches!(next, '"' | '\'' | '(' | '\u{201c}' | '\u{2018}');
        if !opens_sentence {
            i = after;
            continue;
        }

        if c == '.' && is_abbreviation(text, dot_pos, start) {
            i = after;
            continue;
        }

        let slice_end = if after < chars.len() {
            chars[after].0
        } else {
            text.len()
        };
        let sentence = text[start..slice_end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = chars[j].0;
        i = j;
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn is_abbreviation(text: &str, dot_pos: usize, sentence_start: usize) -> bool {
    let before = &text[sentence_start..dot_pos];
    let token = before
        .rsplit(|ch: char| ch.is_whitespace())
        .next()
        .unwrap_or("");
    let token = token.trim_start_matches(|ch: char| matches!(ch, '(' | '"' | '\'' | '\u{201c}'));

    // Single capital initials: "J. K. Rowling".
    let mut chars = token.chars();
    if let (Some(first), None) = (chars.next(), chars.next()) {
        if first.is_alphabetic() && first.is_uppercase() {
            return true;
        }
    }

    let lowered = token.trim_end_matches('.').to_lowercase();
    ABBREVIATIONS.contains(&lowered.as_str())
}

//! Whitespace tokenization shared by the chunker and the context assembler.
//!
//! A token is a run of non-whitespace characters together with the
//! whitespace that follows it. Whitespace before the first word is folded
//! into the first token, so the spans tile the input exactly.

use std::ops::Range;

/// Byte ranges of every token, contiguous and covering `text` end to end.
///
/// Whitespace-only input has no tokens.
pub fn token_spans(text: &str) -> Vec<Range<usize>> {
    let starts = word_starts(text);
    let mut spans = Vec::with_capacity(starts.len());

    for (position, start) in starts.iter().enumerate() {
        let begin = if position == 0 { 0 } else { *start };
        let end = starts.get(position + 1).copied().unwrap_or(text.len());
        spans.push(begin..end);
    }

    spans
}

pub fn count_tokens(text: &str) -> usize {
    word_starts(text).len()
}

fn word_starts(text: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut previous_is_space = true;

    for (index, ch) in text.char_indices() {
        let is_space = ch.is_whitespace();
        if !is_space && previous_is_space {
            starts.push(index);
        }
        previous_is_space = is_space;
    }

    starts
}

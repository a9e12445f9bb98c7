//! Sentence segmentation over byte spans.
//!
//! Units returned here partition the trimmed document: each unit runs from
//! the first byte of a sentence to the first byte of the next one, so the
//! whitespace between sentences belongs to the earlier unit. Chunks built
//! from consecutive units are therefore contiguous slices of the source.

use std::ops::Range;

/// Words that end in a period without ending a sentence.
const ABBREVIATIONS: &[&str] = &[
    "e.g", "i.e", "al", "fig", "figs", "eq", "eqs", "vs", "cf", "dr", "mr", "mrs", "ms", "prof",
    "no", "vol", "pp", "sec", "ch", "approx", "resp", "ref", "refs", "thm",
];

/// Byte range of `text` without leading and trailing whitespace.
pub(crate) fn trimmed_bounds(text: &str) -> Option<(usize, usize)> {
    let start = text.len() - text.trim_start().len();
    let end = text.trim_end().len();
    (start < end).then_some((start, end))
}

/// Split `text[start..end]` into contiguous sentence units.
///
/// A sentence ends at `.`, `!` or `?` (optionally followed by closing quotes
/// or brackets) when whitespace or the end follows, or at a paragraph break.
pub(crate) fn sentence_units(text: &str, start: usize, end: usize) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut units = Vec::new();
    let mut sent_start = start;
    let mut i = start;

    while i < end {
        let b = bytes[i];
        let boundary = if matches!(b, b'.' | b'!' | b'?') {
            let mut j = i + 1;
            while j < end && matches!(bytes[j], b'.' | b'!' | b'?') {
                j += 1;
            }
            while j < end && matches!(bytes[j], b'"' | b'\'' | b')' | b']') {
                j += 1;
            }
            let at_break = j == end || bytes[j].is_ascii_whitespace();
            (at_break && !(b == b'.' && is_abbreviation(&text[sent_start..i]))).then_some(j)
        } else if b == b'\n' {
            let mut j = i + 1;
            let mut newlines = 1;
            while j < end && bytes[j].is_ascii_whitespace() {
                if bytes[j] == b'\n' {
                    newlines += 1;
                }
                j += 1;
            }
            (newlines >= 2).then_some(i)
        } else {
            None
        };

        match boundary {
            Some(sentence_end) if sentence_end > sent_start => {
                let mut next = sentence_end;
                while next < end && bytes[next].is_ascii_whitespace() {
                    next += 1;
                }
                units.push(sent_start..next);
                sent_start = next;
                i = next.max(i + 1);
            }
            _ => i += 1,
        }
    }

    if sent_start < end {
        units.push(sent_start..end);
    }
    units
}

fn is_abbreviation(prefix: &str) -> bool {
    let word = prefix
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("")
        .trim_start_matches(|c: char| c == '(' || c == '[' || c == '"');

    // Initials such as "J." in "J. Smith"
    if word.chars().count() == 1 && word.chars().all(char::is_uppercase) {
        return true;
    }
    let lowered = word.to_lowercase();
    ABBREVIATIONS.contains(&lowered.as_str())
}

/// End offsets of the sentence text (trailing whitespace excluded) of each unit.
pub(crate) fn sentence_ends(text: &str, units: &[Range<usize>]) -> Vec<usize> {
    units
        .iter()
        .map(|u| u.start + text[u.clone()].trim_end().len())
        .collect()
}

/// Split any unit longer than `max` at word boundaries, falling back to
/// character boundaries for single words longer than `max`.
pub(crate) fn split_oversized(
    text: &str,
    units: Vec<Range<usize>>,
    max: usize,
) -> Vec<Range<usize>> {
    let mut out = Vec::with_capacity(units.len());
    for unit in units {
        if unit.len() <= max {
            out.push(unit);
        } else {
            split_at_words(text, unit, max, &mut out);
        }
    }
    out
}

fn split_at_words(text: &str, unit: Range<usize>, max: usize, out: &mut Vec<Range<usize>>) {
    let bytes = text.as_bytes();
    let mut current: Option<Range<usize>> = None;
    let mut pos = unit.start;

    while pos < unit.end {
        // A token is a word plus the whitespace that follows it
        let mut token_end = pos;
        while token_end < unit.end && !bytes[token_end].is_ascii_whitespace() {
            token_end += 1;
        }
        while token_end < unit.end && bytes[token_end].is_ascii_whitespace() {
            token_end += 1;
        }
        let token = pos..token_end;
        pos = token_end;

        if token.len() > max {
            if let Some(range) = current.take() {
                out.push(range);
            }
            split_at_chars(text, token, max, out);
            continue;
        }

        current = match current {
            Some(range) if token.end - range.start <= max => Some(range.start..token.end),
            Some(range) => {
                out.push(range);
                Some(token)
            }
            None => Some(token),
        };
    }

    if let Some(range) = current {
        out.push(range);
    }
}

fn split_at_chars(text: &str, token: Range<usize>, max: usize, out: &mut Vec<Range<usize>>) {
    let mut start = token.start;
    while start < token.end {
        let mut end = floor_char_boundary(text, (start + max).min(token.end));
        if end <= start {
            end = ceil_char_boundary(text, start + 1);
        }
        out.push(start..end);
        start = end;
    }
}

pub(crate) fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

pub(crate) fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(text: &str) -> Vec<&str> {
        let (start, end) = trimmed_bounds(text).unwrap();
        sentence_units(text, start, end)
            .into_iter()
            .map(|r| text[r].trim_end())
            .collect()
    }

    #[test]
    fn test_basic_sentences() {
        assert_eq!(
            sentences("First one. Second one! Third one? Fourth"),
            vec!["First one.", "Second one!", "Third one?", "Fourth"]
        );
    }

    #[test]
    fn test_abbreviations_and_initials() {
        assert_eq!(
            sentences(
                "Models, e.g. transformers, work. See Fig. 3 by J. Smith et al. for details."
            ),
            vec!["Models, e.g. transformers, work.", "See Fig. 3 by J. Smith et al. for details."]
        );
    }

    #[test]
    fn test_decimals_and_quotes() {
        assert_eq!(
            sentences("The value is 3.14 exactly. He said \"stop.\" Then left."),
            vec!["The value is 3.14 exactly.", "He said \"stop.\"", "Then left."]
        );
    }

    #[test]
    fn test_paragraph_break() {
        assert_eq!(
            sentences("Heading without period\n\nBody text here."),
            vec!["Heading without period", "Body text here."]
        );
    }

    #[test]
    fn test_units_are_contiguous() {
        let text = "  One. Two.   Three.\n\nFour  ";
        let (start, end) = trimmed_bounds(text).unwrap();
        let units = sentence_units(text, start, end);
        assert_eq!(units.first().unwrap().start, start);
        assert_eq!(units.last().unwrap().end, end);
        for pair in units.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_split_oversized_at_words() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let pieces = split_oversized(text, vec![0..text.len()], 12);
        let mut rebuilt = String::new();
        for piece in &pieces {
            assert!(piece.len() <= 12);
            rebuilt.push_str(&text[piece.clone()]);
        }
        assert_eq!(rebuilt, text);
        assert!(pieces.iter().all(|p| !text[p.clone()].starts_with(' ')));
    }

    #[test]
    fn test_split_long_word_on_char_boundaries() {
        let text = "ééééééééééééééééé";
        let pieces = split_oversized(text, vec![0..text.len()], 5);
        for piece in &pieces {
            assert!(text.is_char_boundary(piece.start));
            assert!(text.is_char_boundary(piece.end));
            assert!(piece.len() <= 5);
        }
        assert_eq!(pieces.last().unwrap().end, text.len());
    }

    #[test]
    fn test_blank_has_no_bounds() {
        assert_eq!(trimmed_bounds("   \n\t "), None);
        assert_eq!(trimmed_bounds(" a "), Some((1, 2)));
    }
}

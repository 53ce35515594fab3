// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prompt emphasis grammar.
//!
//! Hosts let users re-weight spans of a prompt: `(text)` multiplies the
//! span's attention weight by 1.1, `[text]` by 1/1.1, `(text:1.5)` sets an
//! explicit multiplier, and nesting compounds. `\(` and friends escape to
//! literal characters, and the standalone word `BREAK` forces a chunk
//! boundary downstream. [`parse_prompt_attention`] turns a raw prompt line
//! into `(text, weight)` segments with those rules applied.

/// Weight multiplier for an unannotated `(span)`.
pub const ROUND_BRACKET_MULTIPLIER: f32 = 1.1;

/// Weight multiplier for a `[span]`.
pub const SQUARE_BRACKET_MULTIPLIER: f32 = 1.0 / 1.1;

/// Weight marking a `BREAK` segment; never a real multiplier.
pub const BREAK_WEIGHT: f32 = -1.0;

/// Parse a prompt line into emphasis-weighted text segments.
///
/// Unbalanced closers are kept as literal text; unbalanced openers apply
/// their multiplier to everything after them. Adjacent segments with equal
/// weights are merged. An empty prompt yields a single empty segment with
/// weight 1.0.
///
/// # Example
///
/// ```
/// use candle_daam::tokenizer::emphasis::parse_prompt_attention;
///
/// let segments = parse_prompt_attention("a (red:1.5) ball");
/// assert_eq!(
///     segments,
///     vec![
///         ("a ".to_string(), 1.0),
///         ("red".to_string(), 1.5),
///         (" ball".to_string(), 1.0),
///     ]
/// );
/// ```
#[must_use]
pub fn parse_prompt_attention(text: &str) -> Vec<(String, f32)> {
    let chars: Vec<char> = text.chars().collect();
    let mut res: Vec<(String, f32)> = Vec::new();
    let mut round_brackets: Vec<usize> = Vec::new();
    let mut square_brackets: Vec<usize> = Vec::new();
    let mut pending = String::new();

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                // Escape segments break the text run, so BREAK never spans one.
                flush_pending(&mut res, &mut pending);
                match chars.get(i + 1) {
                    Some(&c @ ('(' | ')' | '[' | ']' | '\\')) => {
                        pending.push(c);
                        i += 2;
                    }
                    _ => i += 1,
                }
            }
            '(' => {
                flush_pending(&mut res, &mut pending);
                round_brackets.push(res.len());
                i += 1;
            }
            '[' => {
                flush_pending(&mut res, &mut pending);
                square_brackets.push(res.len());
                i += 1;
            }
            ')' => {
                flush_pending(&mut res, &mut pending);
                match round_brackets.pop() {
                    Some(start) => multiply_range(&mut res, start, ROUND_BRACKET_MULTIPLIER),
                    None => pending.push(')'),
                }
                i += 1;
            }
            ']' => {
                flush_pending(&mut res, &mut pending);
                match square_brackets.pop() {
                    Some(start) => multiply_range(&mut res, start, SQUARE_BRACKET_MULTIPLIER),
                    None => pending.push(']'),
                }
                i += 1;
            }
            ':' => match scan_explicit_weight(&chars, i) {
                Some((weight, end)) => {
                    flush_pending(&mut res, &mut pending);
                    match round_brackets.pop() {
                        Some(start) => multiply_range(&mut res, start, weight),
                        // `:1.5)` outside brackets stays literal.
                        None => pending.extend(&chars[i..end]),
                    }
                    i = end;
                }
                None => {
                    pending.push(':');
                    i += 1;
                }
            },
            c => {
                pending.push(c);
                i += 1;
            }
        }
    }
    flush_pending(&mut res, &mut pending);

    for &start in &round_brackets {
        multiply_range(&mut res, start, ROUND_BRACKET_MULTIPLIER);
    }
    for &start in &square_brackets {
        multiply_range(&mut res, start, SQUARE_BRACKET_MULTIPLIER);
    }

    if res.is_empty() {
        res.push((String::new(), 1.0));
    }

    merge_equal_weights(res)
}

fn multiply_range(res: &mut [(String, f32)], start: usize, multiplier: f32) {
    for segment in &mut res[start..] {
        segment.1 *= multiplier;
    }
}

/// Push the accumulated text run, splitting out standalone `BREAK` words.
fn flush_pending(res: &mut Vec<(String, f32)>, pending: &mut String) {
    if pending.is_empty() {
        return;
    }
    for (k, part) in split_break(pending).into_iter().enumerate() {
        if k > 0 {
            res.push(("BREAK".to_string(), BREAK_WEIGHT));
        }
        res.push((part, 1.0));
    }
    pending.clear();
}

/// Split a text run on word-bounded `BREAK`, consuming surrounding
/// whitespace like the host grammar does.
fn split_break(text: &str) -> Vec<String> {
    const NEEDLE: [char; 5] = ['B', 'R', 'E', 'A', 'K'];
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + NEEDLE.len() <= chars.len() {
        let bounded = chars[i..i + NEEDLE.len()] == NEEDLE
            && (i == 0 || !is_word_char(chars[i - 1]))
            && chars
                .get(i + NEEDLE.len())
                .is_none_or(|&c| !is_word_char(c));
        if bounded {
            let mut left = i;
            while left > start && chars[left - 1].is_whitespace() {
                left -= 1;
            }
            let mut right = i + NEEDLE.len();
            while chars.get(right).is_some_and(|c| c.is_whitespace()) {
                right += 1;
            }
            parts.push(chars[start..left].iter().collect());
            start = right;
            i = right;
        } else {
            i += 1;
        }
    }
    parts.push(chars[start..].iter().collect());
    parts
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Scan `:\s*[+-]?[.\d]+\s*\)` starting at the colon. Returns the parsed
/// weight and the index one past the closing paren.
fn scan_explicit_weight(chars: &[char], colon: usize) -> Option<(f32, usize)> {
    let mut i = colon + 1;
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    let num_start = i;
    if matches!(chars.get(i), Some('+' | '-')) {
        i += 1;
    }
    let digits_start = i;
    while chars.get(i).is_some_and(|&c| c.is_ascii_digit() || c == '.') {
        i += 1;
    }
    if i == digits_start {
        return None;
    }
    let number: String = chars[num_start..i].iter().collect();
    let weight = number.parse::<f32>().ok()?;
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    if chars.get(i) == Some(&')') {
        Some((weight, i + 1))
    } else {
        None
    }
}

/// Merge runs of segments that ended up with the same weight.
#[allow(clippy::float_cmp)]
fn merge_equal_weights(res: Vec<(String, f32)>) -> Vec<(String, f32)> {
    let mut merged: Vec<(String, f32)> = Vec::with_capacity(res.len());
    for (text, weight) in res {
        match merged.last_mut() {
            Some(last) if last.1 == weight => last.0.push_str(&text),
            _ => merged.push((text, weight)),
        }
    }
    merged
}

// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn segs(text: &str) -> Vec<(String, f32)> {
        parse_prompt_attention(text)
    }

    fn owned(parts: &[(&str, f32)]) -> Vec<(String, f32)> {
        parts.iter().map(|(t, w)| ((*t).to_string(), *w)).collect()
    }

    #[test]
    fn plain_text_is_one_segment() {
        assert_eq!(segs("a cat on a mat"), owned(&[("a cat on a mat", 1.0)]));
    }

    #[test]
    fn empty_input_yields_empty_segment() {
        assert_eq!(segs(""), owned(&[("", 1.0)]));
    }

    #[test]
    fn round_brackets_weight_up() {
        assert_eq!(
            segs("a (cat) here"),
            owned(&[("a ", 1.0), ("cat", 1.1), (" here", 1.0)])
        );
    }

    #[test]
    fn square_brackets_weight_down() {
        assert_eq!(
            segs("a [cat] here"),
            owned(&[("a ", 1.0), ("cat", 1.0 / 1.1), (" here", 1.0)])
        );
    }

    #[test]
    fn explicit_weight() {
        assert_eq!(
            segs("(red:1.5) ball"),
            owned(&[("red", 1.5), (" ball", 1.0)])
        );
    }

    #[test]
    fn explicit_weight_allows_spaces_and_sign() {
        assert_eq!(segs("(x : -0.5 )"), owned(&[("x ", -0.5)]));
    }

    #[test]
    fn nesting_compounds() {
        let out = segs("((cat))");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "cat");
        assert!((out[0].1 - 1.1 * 1.1).abs() < 1e-6);
    }

    #[test]
    fn unbalanced_opener_applies_to_rest() {
        assert_eq!(segs("a (cat"), owned(&[("a ", 1.0), ("cat", 1.1)]));
    }

    #[test]
    fn unbalanced_closer_stays_literal() {
        assert_eq!(segs("a cat) b"), owned(&[("a cat) b", 1.0)]));
    }

    #[test]
    fn escapes_are_literal() {
        assert_eq!(segs(r"a \(cat\)"), owned(&[("a (cat)", 1.0)]));
        assert_eq!(segs(r"\\"), owned(&[(r"\", 1.0)]));
    }

    #[test]
    fn colon_without_weight_is_literal() {
        assert_eq!(segs("style: bold"), owned(&[("style: bold", 1.0)]));
    }

    #[test]
    fn explicit_weight_outside_brackets_is_literal() {
        assert_eq!(segs("a:1.5) b"), owned(&[("a:1.5) b", 1.0)]));
    }

    #[test]
    fn break_splits_with_marker() {
        assert_eq!(
            segs("a cat BREAK red ball"),
            owned(&[("a cat", 1.0), ("BREAK", -1.0), ("red ball", 1.0)])
        );
    }

    #[test]
    fn break_requires_word_boundary() {
        assert_eq!(segs("aBREAK"), owned(&[("aBREAK", 1.0)]));
        assert_eq!(segs("BREAKs"), owned(&[("BREAKs", 1.0)]));
    }

    #[test]
    fn adjacent_equal_weights_merge() {
        assert_eq!(segs("a (b) (c)"), owned(&[("a ", 1.0), ("b", 1.1), (" ", 1.0), ("c", 1.1)]));
        assert_eq!(segs("(a)(b)"), owned(&[("ab", 1.1)]));
    }

    #[test]
    fn weight_applies_only_inside_brackets() {
        let out = segs("far (near:2.0) far");
        assert_eq!(out, owned(&[("far ", 1.0), ("near", 2.0), (" far", 1.0)]));
    }
}

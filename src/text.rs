//! Narration normalization shared by the synthesis request and the caption aligner.
//!
//! Both sides must see the same text: the aligner counts whitespace-delimited words and
//! assumes the speech engine was fed exactly those words.

const QUOTE_CHARS: &[char] = &[
    '\'', '\u{2018}', '\u{2019}', '\u{201a}', '\u{201b}', '"', '\u{201c}', '\u{201d}',
    '\u{201e}', '\u{201f}',
];

const ELLIPSIS: char = '\u{2026}';

/// Strips every quotation mark, normalizes ellipses to `...` and collapses whitespace runs.
pub fn preprocess_for_tts(text: &str) -> String {
    let mut unquoted = String::with_capacity(text.len());
    let mut in_ellipsis = false;
    for ch in text.chars() {
        if QUOTE_CHARS.contains(&ch) {
            continue;
        }
        if ch == ELLIPSIS {
            if !in_ellipsis {
                unquoted.push_str("...");
                in_ellipsis = true;
            }
            continue;
        }
        in_ellipsis = false;
        unquoted.push(ch);
    }

    let dots = collapse_long_dot_runs(&unquoted);
    dots.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collapse_long_dot_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0usize;
    for ch in text.chars() {
        if ch == '.' {
            run += 1;
            continue;
        }
        flush_dots(&mut out, run);
        run = 0;
        out.push(ch);
    }
    flush_dots(&mut out, run);
    out
}

fn flush_dots(out: &mut String, run: usize) {
    let keep = if run >= 4 { 3 } else { run };
    out.extend(std::iter::repeat_n('.', keep));
}

/// Whitespace-delimited words of already-preprocessed text.
pub fn narration_words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

use crate::align::AlignmentResult;
use crate::srt::TimingEntry;
use std::time::Duration;

/// How many trailing entries are inspected for compressed timing.
pub const TAIL_WINDOW: usize = 3;
/// A word of two or more characters spoken faster than this is suspicious.
pub const MIN_WORD_DURATION: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TruncationVerdict {
    pub truncated: bool,
    /// Offending words with their durations, empty when not truncated.
    pub detail: String,
}

impl TruncationVerdict {
    fn clean() -> Self {
        Self::default()
    }

    fn flagged(detail: String) -> Self {
        Self {
            truncated: true,
            detail,
        }
    }
}

/// Decides whether the audio behind `result` was likely cut short.
///
/// Missing words always count as truncation. When the counts match exactly, degenerate
/// near-zero timings among the last [`TAIL_WINDOW`] entries also do.
pub fn detect_truncation(result: &AlignmentResult, entries: &[TimingEntry]) -> TruncationVerdict {
    if result.is_missing_words() {
        let missing = result.narration_word_count - result.timing_word_count;
        return TruncationVerdict::flagged(format!(
            "{} word(s) missing ({} of {} spoken)",
            missing, result.timing_word_count, result.narration_word_count
        ));
    }

    if !result.is_valid {
        return TruncationVerdict::clean();
    }

    match compressed_tail(entries) {
        Some(detail) => TruncationVerdict::flagged(detail),
        None => TruncationVerdict::clean(),
    }
}

fn compressed_tail(entries: &[TimingEntry]) -> Option<String> {
    let tail_start = entries.len().saturating_sub(TAIL_WINDOW);
    let suspicious: Vec<String> = entries[tail_start..]
        .iter()
        .filter(|e| e.text.chars().count() >= 2 && e.duration() < MIN_WORD_DURATION)
        .map(|e| format!("{}({:.3}s)", e.text, e.duration().as_secs_f64()))
        .collect();

    if suspicious.is_empty() {
        None
    } else {
        Some(suspicious.join(", "))
    }
}

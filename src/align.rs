use crate::logw;
use crate::srt::{self, TimingEntry};
use crate::text::narration_words;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedCaption {
    pub text: String,
    pub start: Duration,
    pub end: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentResult {
    pub captions: Vec<AlignedCaption>,
    /// Word counts matched. Says nothing about truncation on its own.
    pub is_valid: bool,
    pub timing_word_count: usize,
    pub narration_word_count: usize,
}

impl AlignmentResult {
    pub fn to_srt(&self) -> String {
        srt::render_blocks(
            self.captions
                .iter()
                .map(|c| (c.start, c.end, c.text.as_str())),
        )
    }

    /// Fewer spoken units than narration words.
    pub fn is_missing_words(&self) -> bool {
        self.timing_word_count < self.narration_word_count
    }
}

/// Substitutes narration word `i` into timing entry `i`, one caption per entry.
///
/// Entries past the end of the narration keep their recognized text. `narration` must already
/// have gone through [`crate::text::preprocess_for_tts`].
pub fn align_to_narration(entries: &[TimingEntry], narration: &str) -> AlignmentResult {
    let words = narration_words(narration);
    let timing_word_count = entries.len();
    let narration_word_count = words.len();

    if timing_word_count != narration_word_count {
        logw(format!(
            "word count mismatch (narration: {}, timing: {})",
            narration_word_count, timing_word_count
        ));
    }

    let captions = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| AlignedCaption {
            text: words
                .get(i)
                .map(|w| (*w).to_string())
                .unwrap_or_else(|| entry.text.clone()),
            start: entry.start,
            end: entry.end,
        })
        .collect();

    AlignmentResult {
        captions,
        is_valid: timing_word_count == narration_word_count,
        timing_word_count,
        narration_word_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(texts: &[&str]) -> Vec<TimingEntry> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| TimingEntry {
                index: i + 1,
                start: Duration::from_millis(i as u64 * 400),
                end: Duration::from_millis(i as u64 * 400 + 350),
                text: (*t).to_string(),
            })
            .collect()
    }

    #[test]
    fn substitutes_narration_words_in_order() {
        let timings = entries(&["오늘", "날씨거", "좋습니다"]);
        let result = align_to_narration(&timings, "오늘 날씨가 좋습니다.");
        assert!(result.is_valid);
        let words: Vec<_> = result.captions.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(words, vec!["오늘", "날씨가", "좋습니다."]);
        assert_eq!(result.captions[1].start, Duration::from_millis(400));
        assert_eq!(result.captions[1].end, Duration::from_millis(750));
    }

    #[test]
    fn shorter_timing_uses_leading_narration_words() {
        let narration = "one two three four five six seven eight nine ten";
        let timings = entries(&["a", "b", "c", "d", "e", "f", "g"]);
        let result = align_to_narration(&timings, narration);
        assert_eq!(result.captions.len(), 7);
        assert!(!result.is_valid);
        assert!(result.is_missing_words());
        assert_eq!(result.captions[6].text, "seven");
        assert_eq!(result.narration_word_count, 10);
        assert_eq!(result.timing_word_count, 7);
    }

    #[test]
    fn longer_timing_falls_back_to_recognized_text() {
        let timings = entries(&["x", "y", "extra"]);
        let result = align_to_narration(&timings, "alpha beta");
        assert_eq!(result.captions.len(), 3);
        assert_eq!(result.captions[2].text, "extra");
        assert!(!result.is_valid);
        assert!(!result.is_missing_words());
    }

    #[test]
    fn caption_count_always_matches_timing_count() {
        let narrations = ["", "one", "one two", "one two three four five"];
        for m in 0..6 {
            let texts: Vec<String> = (0..m).map(|i| format!("w{i}")).collect();
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            let timings = entries(&refs);
            for narration in narrations {
                let n = narration.split_whitespace().count();
                let result = align_to_narration(&timings, narration);
                assert_eq!(result.captions.len(), m);
                assert_eq!(result.is_valid, m == n);
            }
        }
    }

    #[test]
    fn empty_timing_is_valid_only_for_empty_narration() {
        assert!(align_to_narration(&[], "").is_valid);
        assert!(!align_to_narration(&[], "word").is_valid);
        assert!(align_to_narration(&[], "word").captions.is_empty());
    }

    #[test]
    fn renders_corrected_captions() {
        let timings = entries(&["오늘", "날시가"]);
        let result = align_to_narration(&timings, "오늘 날씨가");
        assert_eq!(
            result.to_srt(),
            "1\n00:00:00,000 --> 00:00:00,350\n오늘\n\n2\n00:00:00,400 --> 00:00:00,750\n날씨가\n"
        );
    }
}

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static TIMING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{2}):(\d{2}):(\d{2})[,.](\d{3})\s*-->\s*(\d{2}):(\d{2}):(\d{2})[,.](\d{3})")
        .expect("timing line regex is valid")
});

/// One numbered block of the speech service's word timing transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingEntry {
    /// 1-based, contiguous over the entries that parsed.
    pub index: usize,
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

impl TimingEntry {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

fn hms_to_duration(h: &str, m: &str, s: &str, ms: &str) -> Option<Duration> {
    let hh: u64 = h.parse().ok()?;
    let mm: u64 = m.parse().ok()?;
    let ss: u64 = s.parse().ok()?;
    let millis: u64 = ms.parse().ok()?;
    Some(Duration::from_millis(
        hh * 3_600_000 + mm * 60_000 + ss * 1000 + millis,
    ))
}

/// Parses a `HH:MM:SS,mmm --> HH:MM:SS,mmm` line (`.` also accepted before the millis).
pub fn parse_time_range(line: &str) -> Option<(Duration, Duration)> {
    let cap = TIMING_RE.captures(line)?;
    let start = hms_to_duration(&cap[1], &cap[2], &cap[3], &cap[4])?;
    let end = hms_to_duration(&cap[5], &cap[6], &cap[7], &cap[8])?;
    Some((start, end))
}

pub fn format_timestamp(ts: Duration) -> String {
    let total_ms = ts.as_millis();
    let hh = total_ms / 3_600_000;
    let mm = (total_ms / 60_000) % 60;
    let ss = (total_ms / 1000) % 60;
    let ms = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hh, mm, ss, ms)
}

/// Lenient block parser: blocks with fewer than three lines or without a timing range on
/// their second line are skipped, so the result may be shorter than the real word count.
pub fn parse_timings(content: &str) -> Vec<TimingEntry> {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let mut entries = Vec::new();

    for block in normalized.trim().split("\n\n") {
        let lines: Vec<&str> = block.trim().split('\n').collect();
        if lines.len() < 3 {
            continue;
        }
        let Some((start, end)) = parse_time_range(lines[1]) else {
            continue;
        };
        entries.push(TimingEntry {
            index: entries.len() + 1,
            start,
            end,
            text: lines[2..].join(" ").trim().to_string(),
        });
    }

    entries
}

/// Renders numbered caption blocks in the same format the parser consumes.
pub fn render_blocks<'a, I>(blocks: I) -> String
where
    I: IntoIterator<Item = (Duration, Duration, &'a str)>,
{
    blocks
        .into_iter()
        .enumerate()
        .map(|(i, (start, end, text))| {
            format!(
                "{}\n{} --> {}\n{}\n",
                i + 1,
                format_timestamp(start),
                format_timestamp(end),
                text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1\n00:00:00,000 --> 00:00:00,420\n오늘\n\n2\n00:00:00,420 --> 00:00:01,050\n날씨가\n\n3\n00:00:01,050 --> 00:00:01,900\n좋습니다.\n";

    #[test]
    fn parses_well_formed_blocks() {
        let entries = parse_timings(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[1].text, "날씨가");
        assert_eq!(entries[1].start, Duration::from_millis(420));
        assert_eq!(entries[2].end, Duration::from_millis(1900));
        assert_eq!(entries[2].duration(), Duration::from_millis(850));
    }

    #[test]
    fn accepts_crlf_and_period_separator() {
        let content = "1\r\n00:00:01.250 --> 00:00:02.000\r\nhello\r\n\r\n2\r\n01:02:03.004 --> 01:02:04.000\r\nworld\r\n";
        let entries = parse_timings(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].start, Duration::from_millis(1250));
        assert_eq!(entries[1].start, Duration::from_millis(3_723_004));
    }

    #[test]
    fn joins_multi_line_text() {
        let content = "1\n00:00:00,000 --> 00:00:01,000\nfirst\nsecond line\n";
        assert_eq!(parse_timings(content)[0].text, "first second line");
    }

    #[test]
    fn skips_malformed_blocks_and_renumbers() {
        let content = "1\n00:00:00,000 --> 00:00:00,500\na\n\n2\nnot a timing\nb\n\n3\n00:00:01,000\n\n4\n00:00:01,000 --> 00:00:01,500\nd\n";
        let entries = parse_timings(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].text, "d");
        assert_eq!(entries[1].index, 2);
    }

    #[test]
    fn extra_blank_lines_between_blocks_are_tolerated() {
        let content = "\n\n1\n00:00:00,000 --> 00:00:00,500\na\n\n\n\n2\n00:00:00,500 --> 00:00:01,000\nb\n\n";
        assert_eq!(parse_timings(content).len(), 2);
    }

    #[test]
    fn empty_input_yields_no_entries() {
        assert!(parse_timings("").is_empty());
        assert!(parse_timings("\n\n  \n").is_empty());
    }

    #[test]
    fn rendered_blocks_parse_back() {
        let blocks = vec![
            (Duration::from_millis(0), Duration::from_millis(420), "오늘"),
            (Duration::from_millis(3_723_004), Duration::from_millis(3_724_000), "끝"),
        ];
        let rendered = render_blocks(blocks);
        assert!(rendered.starts_with("1\n00:00:00,000 --> 00:00:00,420\n오늘\n\n2\n"));
        let parsed = parse_timings(&rendered);
        assert_eq!(parsed[1].start, Duration::from_millis(3_723_004));
        assert_eq!(parsed[1].text, "끝");
    }
}

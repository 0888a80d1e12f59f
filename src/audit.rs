//! Offline check of stored caption files for clipped audio followed by a hallucinated tail.

use crate::srt::{TimingEntry, parse_timings};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

const MIN_ENTRIES_FOR_TAIL: usize = 5;
const HEAD_FRACTION: f64 = 0.7;
const TAIL_RATIO: f64 = 3.0;
const FAST_ENTRY: Duration = Duration::from_millis(150);
const MIN_STREAK: usize = 3;

/// A caption entry cited by a finding; `position` is 1-based.
#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedEntry {
    pub position: usize,
    pub text: String,
    pub duration_ms: u64,
}

impl FlaggedEntry {
    fn new(position: usize, entry: &TimingEntry) -> Self {
        Self {
            position,
            text: entry.text.clone(),
            duration_ms: entry.duration().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuditFinding {
    /// The last 30% of entries is on average more than three times shorter than the rest.
    TailCompression {
        total_entries: usize,
        head_avg_ms: u64,
        tail_avg_ms: u64,
        ratio: f64,
        tail: Vec<FlaggedEntry>,
    },
    /// Runs of three or more consecutive entries each under 150 ms.
    ConsecutiveFast { streaks: Vec<Vec<FlaggedEntry>> },
}

fn mean_secs(entries: &[TimingEntry]) -> f64 {
    let total: f64 = entries.iter().map(|e| e.duration().as_secs_f64()).sum();
    total / entries.len() as f64
}

fn tail_compression(entries: &[TimingEntry]) -> Option<AuditFinding> {
    if entries.len() < MIN_ENTRIES_FOR_TAIL {
        return None;
    }
    let split = (entries.len() as f64 * HEAD_FRACTION) as usize;
    let (head, tail) = entries.split_at(split);
    if head.is_empty() || tail.is_empty() {
        return None;
    }

    let head_avg = mean_secs(head);
    let tail_avg = mean_secs(tail);
    if head_avg <= 0.0 || tail_avg <= 0.0 || head_avg / tail_avg <= TAIL_RATIO {
        return None;
    }

    Some(AuditFinding::TailCompression {
        total_entries: entries.len(),
        head_avg_ms: (head_avg * 1000.0) as u64,
        tail_avg_ms: (tail_avg * 1000.0) as u64,
        ratio: (head_avg / tail_avg * 10.0).round() / 10.0,
        tail: tail
            .iter()
            .enumerate()
            .map(|(i, e)| FlaggedEntry::new(split + i + 1, e))
            .collect(),
    })
}

fn fast_streaks(entries: &[TimingEntry]) -> Vec<Vec<FlaggedEntry>> {
    let mut streaks = Vec::new();
    let mut current = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if entry.duration() < FAST_ENTRY {
            current.push(FlaggedEntry::new(i + 1, entry));
        } else {
            if current.len() >= MIN_STREAK {
                streaks.push(std::mem::take(&mut current));
            }
            current.clear();
        }
    }
    if current.len() >= MIN_STREAK {
        streaks.push(current);
    }
    streaks
}

/// Tail compression wins over fast streaks when both apply.
pub fn audit_captions(content: &str) -> Option<AuditFinding> {
    let entries = parse_timings(content);
    if entries.is_empty() {
        return None;
    }
    if let Some(finding) = tail_compression(&entries) {
        return Some(finding);
    }
    let streaks = fast_streaks(&entries);
    if streaks.is_empty() {
        None
    } else {
        Some(AuditFinding::ConsecutiveFast { streaks })
    }
}

#[derive(Debug, Clone)]
pub struct AuditedFile {
    pub path: PathBuf,
    pub finding: AuditFinding,
}

/// Audits every `*.srt` below `root`, sorted by path. Unreadable files are skipped.
pub fn audit_directory(root: &Path) -> Result<Vec<AuditedFile>> {
    if !root.is_dir() {
        anyhow::bail!("Not a directory: {}", root.display());
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("srt")))
        .collect();
    paths.sort();

    let mut flagged = Vec::new();
    for path in paths {
        let content = match std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
        {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                crate::logw(format!("{e:#}"));
                continue;
            }
        };
        if let Some(finding) = audit_captions(&content) {
            flagged.push(AuditedFile { path, finding });
        }
    }
    Ok(flagged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srt::render_blocks;

    fn captions(durations_ms: &[u64]) -> String {
        let mut start = 0;
        let blocks: Vec<(Duration, Duration, &str)> = durations_ms
            .iter()
            .map(|d| {
                let block = (
                    Duration::from_millis(start),
                    Duration::from_millis(start + d),
                    "단어",
                );
                start += d;
                block
            })
            .collect();
        render_blocks(blocks)
    }

    #[test]
    fn even_pacing_is_clean() {
        assert_eq!(audit_captions(&captions(&[400, 350, 420, 380, 410, 390])), None);
    }

    #[test]
    fn compressed_tail_is_flagged() {
        let content = captions(&[500, 500, 500, 500, 500, 500, 500, 100, 100, 100]);
        match audit_captions(&content) {
            Some(AuditFinding::TailCompression {
                total_entries,
                head_avg_ms,
                tail_avg_ms,
                ratio,
                tail,
            }) => {
                assert_eq!(total_entries, 10);
                assert_eq!(head_avg_ms, 500);
                assert_eq!(tail_avg_ms, 100);
                assert_eq!(ratio, 5.0);
                let positions: Vec<usize> = tail.iter().map(|e| e.position).collect();
                assert_eq!(positions, vec![8, 9, 10]);
            }
            other => panic!("unexpected finding: {other:?}"),
        }
    }

    #[test]
    fn short_files_skip_tail_check() {
        assert!(matches!(
            audit_captions(&captions(&[500, 500, 100, 100])),
            None
        ));
    }

    #[test]
    fn fast_streaks_are_collected() {
        let content = captions(&[300, 100, 90, 80, 300, 300, 120, 110, 100, 130]);
        match audit_captions(&content) {
            Some(AuditFinding::ConsecutiveFast { streaks }) => {
                assert_eq!(streaks.len(), 2);
                assert_eq!(streaks[0].len(), 3);
                assert_eq!(streaks[0][0].position, 2);
                assert_eq!(streaks[1].len(), 4);
            }
            other => panic!("unexpected finding: {other:?}"),
        }
    }

    #[test]
    fn two_fast_entries_are_not_a_streak() {
        assert_eq!(audit_captions(&captions(&[300, 100, 100, 300, 300])), None);
    }

    #[test]
    fn directory_scan_finds_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("projects/1/subtitles");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("scene_01.srt"), captions(&[400, 400, 400, 400, 400])).unwrap();
        std::fs::write(
            nested.join("scene_02.srt"),
            captions(&[600, 600, 600, 600, 600, 600, 600, 50, 50, 50]),
        )
        .unwrap();
        std::fs::write(nested.join("notes.txt"), "ignored").unwrap();

        let flagged = audit_directory(dir.path()).unwrap();
        assert_eq!(flagged.len(), 1);
        assert!(flagged[0].path.ends_with("scene_02.srt"));
        assert!(audit_directory(&dir.path().join("missing")).is_err());
    }
}

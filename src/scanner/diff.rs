//! Scan-result set operations.
//!
//! A scan pass turns two listings (what the NDS has, what the store knows)
//! into a delete set and a candidate set, then gates candidates by archive
//! time against the active task ranges. All pure functions, exercised
//! heavily by tests; the I/O around them lives in the scan loop.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::backend::{DataType, TimeRange};

/// Wallclock format used by the metadata store.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One remote file tagged with the path class that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFile {
    pub path: String,
    pub data_type: DataType,
}

/// Extract the archive wallclock from a file name.
///
/// Vendor names embed it as 14 digits after `_` or `-`, e.g.
/// `FDD-LTE_MRO_ZTE_OMC1_292551_20241220023000.zip` or
/// `..._292551-20241220023000_1.zip`. Returns `None` when no parseable
/// timestamp is present; such candidates are skipped, not guessed.
pub fn extract_archive_time(name: &str) -> Option<NaiveDateTime> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"[_-](\d{14})").expect("static pattern"));
    let digits = pattern.captures(name)?.get(1)?.as_str();
    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()
}

/// Render a wallclock the way the store expects it.
pub fn format_time(time: NaiveDateTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Drop duplicate paths, keeping first occurrence order.
pub fn dedup(files: Vec<ScanFile>) -> Vec<ScanFile> {
    let mut seen = HashSet::new();
    files.into_iter().filter(|file| seen.insert(file.path.clone())).collect()
}

/// Diff a scan result against the store's known archive paths.
///
/// Returns `(candidates, vanished)`: files on the NDS the store has not
/// seen, and paths the store tracks that are gone from the NDS (all their
/// member rows become deletable).
pub fn diff(remote: &[ScanFile], known: &[String]) -> (Vec<ScanFile>, Vec<String>) {
    let remote_paths: HashSet<&str> = remote.iter().map(|file| file.path.as_str()).collect();
    let known_paths: HashSet<&str> = known.iter().map(String::as_str).collect();

    let candidates = remote
        .iter()
        .filter(|file| !known_paths.contains(file.path.as_str()))
        .cloned()
        .collect();
    let vanished = known
        .iter()
        .filter(|path| !remote_paths.contains(path.as_str()))
        .cloned()
        .collect();
    (candidates, vanished)
}

/// Whether an archive time falls inside any active task range
/// (`start ≤ t ≤ end`). With no active ranges nothing qualifies.
pub fn within_ranges(time: NaiveDateTime, ranges: &[TimeRange]) -> bool {
    ranges.iter().any(|range| {
        let start = NaiveDateTime::parse_from_str(&range.start_time, TIME_FORMAT);
        let end = NaiveDateTime::parse_from_str(&range.end_time, TIME_FORMAT);
        match (start, end) {
            (Ok(start), Ok(end)) => start <= time && time <= end,
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, data_type: DataType) -> ScanFile {
        ScanFile { path: path.to_string(), data_type }
    }

    #[test]
    fn archive_time_parses_underscore_and_dash_forms() {
        let time = extract_archive_time("FDD-LTE_MRO_ZTE_OMC1_292551_20241220023000.zip").unwrap();
        assert_eq!(format_time(time), "2024-12-20 02:30:00");

        let time = extract_archive_time("FDD-LTE_MRO_ZTE_OMC1_292551-20241220023000_1.zip").unwrap();
        assert_eq!(format_time(time), "2024-12-20 02:30:00");
    }

    #[test]
    fn archive_time_rejects_garbage() {
        assert!(extract_archive_time("no-timestamp.zip").is_none());
        assert!(extract_archive_time("short_2024122002.zip").is_none());
        // 14 digits but not a real date
        assert!(extract_archive_time("x_20241399999999.zip").is_none());
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let files = vec![
            file("/mro/a.zip", DataType::Mro),
            file("/mro/b.zip", DataType::Mro),
            file("/mro/a.zip", DataType::Mdt),
        ];
        let deduped = dedup(files);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].data_type, DataType::Mro);
    }

    #[test]
    fn diff_splits_candidates_and_vanished() {
        let remote = vec![file("/mro/a.zip", DataType::Mro), file("/mro/b.zip", DataType::Mro)];
        let known = vec!["/mro/b.zip".to_string(), "/mro/gone.zip".to_string()];
        let (candidates, vanished) = diff(&remote, &known);
        assert_eq!(candidates, vec![file("/mro/a.zip", DataType::Mro)]);
        assert_eq!(vanished, vec!["/mro/gone.zip".to_string()]);
    }

    #[test]
    fn range_gate_is_inclusive_and_empty_means_nothing() {
        let time = extract_archive_time("a_20241220023000.zip").unwrap();
        let ranges = vec![TimeRange {
            start_time: "2024-12-20 02:30:00".into(),
            end_time: "2024-12-20 03:00:00".into(),
        }];
        assert!(within_ranges(time, &ranges));
        assert!(!within_ranges(time, &[]));

        let outside = extract_archive_time("a_20241220031500.zip").unwrap();
        assert!(!within_ranges(outside, &ranges));
    }

    #[test]
    fn malformed_ranges_never_match() {
        let time = extract_archive_time("a_20241220023000.zip").unwrap();
        let ranges =
            vec![TimeRange { start_time: "not-a-time".into(), end_time: "also-not".into() }];
        assert!(!within_ranges(time, &ranges));
    }
}

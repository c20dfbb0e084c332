//! Copy-tool output parsing.
//!
//! Every output line of the copy tool is classified by a small ordered table
//! of pattern matchers. The first matcher that accepts a line decides what
//! events it yields; lines nobody accepts are passed through as
//! `RawLogLine`. Parsing is stateless and never fails: truncated or garbled
//! input simply falls through to `RawLogLine`.
//!
//! The patterns follow rclone's `--progress --stats 1s -v` output, e.g.
//!
//! ```text
//! Transferred:        1.234 GiB / 2.000 GiB, 62%, 10.123 MiB/s, ETA 1m17s
//! Transferred:            3 / 10, 30%
//!  *                              A001C003.mov: 45% /1.2Gi, 10.1Mi/s, 1m2s
//! 2024/05/01 10:00:00 INFO  : A001C002.mov: Copied (new)
//! 2024/05/01 10:00:01 ERROR : A001C004.mov: Failed to copy: short write
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};

/// A structured observation extracted from one line of copy-tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Aggregate bytes moved so far and the expected total
    BytesTransferred { transferred: u64, total: u64 },
    /// Aggregate number of files finished and the expected total
    FilesTransferred { done: u64, total: u64 },
    /// A file is in flight
    FileStarted { name: String },
    /// A file finished copying
    FileCompleted { name: String },
    /// Overall completion, 0..=100
    PercentComplete(u8),
    /// Current aggregate throughput
    Speed { bytes_per_second: u64 },
    /// Estimated time remaining; `None` when the tool reports it as unknown
    Eta(Option<Duration>),
    /// Anything not recognised
    RawLogLine(String),
    /// A line reporting a failure
    ErrorLine(String),
}

impl ProgressEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, ProgressEvent::ErrorLine(_))
    }
}

type Build = fn(&Captures<'_>, &str) -> Option<Vec<ProgressEvent>>;

struct Matcher {
    name: &'static str,
    pattern: Regex,
    build: Build,
}

/// Matchers in priority order: (name, pattern, builder).
const MATCHER_TABLE: &[(&str, &str, Build)] = &[
    (
        "bytes-stats",
        r"^Transferred:\s*(?P<done>\d+(?:\.\d+)?\s*[kKMGTPE]?i?B(?:ytes)?)\s*/\s*(?P<total>\d+(?:\.\d+)?\s*[kKMGTPE]?i?B(?:ytes)?)(?P<rest>.*)$",
        build_bytes_stats,
    ),
    (
        "file-stats",
        r"^Transferred:\s*(?P<done>\d+)\s*/\s*(?P<total>\d+)\s*(?:,.*)?$",
        build_file_stats,
    ),
    (
        "error-level",
        r"(?:^|\s)(?:ERROR|CRITICAL)\s*:",
        build_error,
    ),
    (
        "error-prefix",
        r"^(?i:failed to |fatal error|error:)",
        build_error,
    ),
    ("error-counter", r"^Errors:\s*[1-9]\d*", build_error),
    (
        "file-in-flight",
        r"^\*\s+(?P<name>.+?):\s*(?:\d{1,3}%|transferring)",
        build_file_started,
    ),
    (
        "file-copied",
        r"(?:^|\s)INFO\s*:\s*(?P<name>.+?):\s*(?:Multi-thread )?Copied \(",
        build_file_completed,
    ),
];

fn matchers() -> &'static [Matcher] {
    static MATCHERS: OnceLock<Vec<Matcher>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        MATCHER_TABLE
            .iter()
            .filter_map(|&(name, pattern, build)| match Regex::new(pattern) {
                Ok(pattern) => Some(Matcher {
                    name,
                    pattern,
                    build,
                }),
                Err(e) => {
                    log::error!("Progress matcher '{}' does not compile: {}", name, e);
                    None
                }
            })
            .collect()
    })
}

fn ansi_escape() -> Option<&'static Regex> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[()][0-9A-Za-z]").ok())
        .as_ref()
}

/// Strip terminal escape sequences and surrounding whitespace.
fn clean(line: &str) -> String {
    let stripped = match ansi_escape() {
        Some(re) => re.replace_all(line, ""),
        None => line.into(),
    };
    stripped.trim().to_string()
}

/// Classify a line, returning its highest-priority event.
pub fn parse(line: &str) -> ProgressEvent {
    parse_all(line)
        .into_iter()
        .next()
        .unwrap_or_else(|| ProgressEvent::RawLogLine(clean(line)))
}

/// Classify a line, returning every event it carries.
///
/// The aggregate stats line carries bytes, percent, speed and ETA at once;
/// most other lines yield exactly one event. Never returns an empty vector.
pub fn parse_all(line: &str) -> Vec<ProgressEvent> {
    let text = clean(line);
    for matcher in matchers() {
        if let Some(caps) = matcher.pattern.captures(&text) {
            match (matcher.build)(&caps, &text) {
                Some(events) if !events.is_empty() => return events,
                _ => log::trace!("Matcher '{}' rejected line: {}", matcher.name, text),
            }
        }
    }
    vec![ProgressEvent::RawLogLine(text)]
}

fn build_bytes_stats(caps: &Captures<'_>, _line: &str) -> Option<Vec<ProgressEvent>> {
    let transferred = parse_size(caps.name("done")?.as_str())?;
    let total = parse_size(caps.name("total")?.as_str())?;
    let mut events = vec![ProgressEvent::BytesTransferred { transferred, total }];

    let rest = caps.name("rest").map_or("", |m| m.as_str());
    for field in rest.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        if let Some(percent) = field.strip_suffix('%') {
            if let Ok(percent) = percent.trim().parse::<u8>() {
                events.push(ProgressEvent::PercentComplete(percent.min(100)));
            }
        } else if let Some(speed) = field.strip_suffix("/s") {
            if let Some(bytes_per_second) = parse_size(speed) {
                events.push(ProgressEvent::Speed { bytes_per_second });
            }
        } else if let Some(eta) = field.strip_prefix("ETA") {
            events.push(ProgressEvent::Eta(parse_eta(eta)));
        }
    }
    Some(events)
}

fn build_file_stats(caps: &Captures<'_>, _line: &str) -> Option<Vec<ProgressEvent>> {
    let done = caps.name("done")?.as_str().parse().ok()?;
    let total = caps.name("total")?.as_str().parse().ok()?;
    Some(vec![ProgressEvent::FilesTransferred { done, total }])
}

fn build_error(_caps: &Captures<'_>, line: &str) -> Option<Vec<ProgressEvent>> {
    Some(vec![ProgressEvent::ErrorLine(line.to_string())])
}

fn build_file_started(caps: &Captures<'_>, _line: &str) -> Option<Vec<ProgressEvent>> {
    let name = caps.name("name")?.as_str().trim();
    (!name.is_empty()).then(|| {
        vec![ProgressEvent::FileStarted {
            name: name.to_string(),
        }]
    })
}

fn build_file_completed(caps: &Captures<'_>, _line: &str) -> Option<Vec<ProgressEvent>> {
    let name = caps.name("name")?.as_str().trim();
    (!name.is_empty()).then(|| {
        vec![ProgressEvent::FileCompleted {
            name: name.to_string(),
        }]
    })
}

/// Parse a size such as `512`, `1.5 GiB`, `10.1Mi`, `16M` or `3 kBytes`.
///
/// All multipliers are powers of 1024.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;

    let unit = unit.trim();
    let unit = unit
        .strip_suffix("Bytes")
        .or_else(|| unit.strip_suffix("bytes"))
        .or_else(|| unit.strip_suffix('B'))
        .unwrap_or(unit);
    let unit = unit.strip_suffix('i').unwrap_or(unit);
    let exponent = match unit.to_ascii_uppercase().as_str() {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        _ => return None,
    };

    let bytes = number * 1024f64.powi(exponent);
    (bytes.is_finite() && bytes >= 0.0 && bytes < u64::MAX as f64).then(|| bytes.round() as u64)
}

/// Parse an ETA such as `1m17s`, `2h3m4s`, `1d2h` or `17.5s`. `-` is unknown.
pub fn parse_eta(text: &str) -> Option<Duration> {
    let text = text.trim().trim_start_matches(':').trim();
    if text.is_empty() || text == "-" {
        return None;
    }

    let mut total = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let value: f64 = rest[..split].parse().ok()?;
        rest = &rest[split..];
        let (seconds, consumed) = if rest.starts_with("ms") {
            (0.001, 2)
        } else {
            let unit = rest.chars().next()?;
            let seconds = match unit {
                'y' => 365.0 * 86_400.0,
                'w' => 7.0 * 86_400.0,
                'd' => 86_400.0,
                'h' => 3_600.0,
                'm' => 60.0,
                's' => 1.0,
                _ => return None,
            };
            (seconds, 1)
        };
        total += value * seconds;
        rest = &rest[consumed..];
    }
    Duration::try_from_secs_f64(total).ok()
}

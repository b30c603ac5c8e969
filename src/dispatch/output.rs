//! Line-by-line monitoring of scan output and final outcome classification.

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

const DONE_MARKER: &str = "Nmap done";
const QUITTING_MARKER: &str = "QUITTING!";
const PRIVILEGE_HINTS: &[&str] = &[
    "requires root privileges",
    "requires privileged access",
    "TCP/IP fingerprinting (for OS scan) requires root privileges",
];
/// Phrases that, shortly before `QUITTING!`, mean the scan needs privileges.
const QUIT_PRIVILEGE_PHRASES: &[&str] = &[
    "root privileges",
    "privileged access",
    "TCP/IP fingerprinting",
];

static PROGRESS_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"About (\d+(?:\.\d+)?)% done").ok());

/// What a single output line means for the running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    Progress(u8),
    /// The scan stopped because it needs elevated privileges.
    PrivilegeRequired,
    Other,
}

/// Tracks the tail of a scan's merged stdout/stderr.
#[derive(Debug, Clone)]
pub struct OutputMonitor {
    tail: VecDeque<String>,
    capacity: usize,
    lines_seen: usize,
    done_marker_seen: bool,
}

impl OutputMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            tail: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            lines_seen: 0,
            done_marker_seen: false,
        }
    }

    pub fn observe(&mut self, line: &str) -> LineEvent {
        let line = line.trim_end();
        self.lines_seen += 1;
        if line.contains(DONE_MARKER) {
            self.done_marker_seen = true;
        }

        let privileged = PRIVILEGE_HINTS.iter().any(|hint| line.contains(hint))
            || (line.contains(QUITTING_MARKER) && self.tail_has_privilege_hint());

        if self.tail.len() == self.capacity {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());

        if privileged {
            return LineEvent::PrivilegeRequired;
        }
        parse_progress(line).map_or(LineEvent::Other, LineEvent::Progress)
    }

    fn tail_has_privilege_hint(&self) -> bool {
        self.tail
            .iter()
            .any(|l| QUIT_PRIVILEGE_PHRASES.iter().any(|p| l.contains(p)))
    }

    pub fn lines_seen(&self) -> usize {
        self.lines_seen
    }

    pub fn done_marker_seen(&self) -> bool {
        self.done_marker_seen
    }

    /// The line right before the last `QUITTING!`, which carries the reason.
    pub fn quitting_reason(&self) -> Option<&str> {
        let idx = self.tail.iter().rposition(|l| l.contains(QUITTING_MARKER))?;
        let reason = self.tail.get(idx.checked_sub(1)?)?;
        let reason = reason.trim();
        (!reason.is_empty()).then_some(reason)
    }

    pub fn last_lines(&self, n: usize) -> Vec<&str> {
        let skip = self.tail.len().saturating_sub(n);
        self.tail.iter().skip(skip).map(String::as_str).collect()
    }
}

fn parse_progress(line: &str) -> Option<u8> {
    let caps = PROGRESS_RE.as_ref()?.captures(line)?;
    let pct: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(pct.clamp(0.0, 100.0) as u8)
}

/// Final verdict on a finished scan process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Succeeded,
    Failed(String),
}

/// Classifies a finished process from its exit code, its output and whether
/// it left an XML report behind.
pub fn classify(monitor: &OutputMonitor, exit_code: Option<i32>, xml_exists: bool) -> Verdict {
    if monitor.lines_seen() == 0 {
        return Verdict::Failed("No output received from scan process".to_string());
    }

    match exit_code {
        Some(0) if xml_exists => {
            if !monitor.done_marker_seen() {
                tracing::warn!("Scan exited cleanly without a completion line");
            }
            Verdict::Succeeded
        }
        Some(0) => Verdict::Failed("Scan completed but XML output file missing".to_string()),
        code => {
            if let Some(reason) = monitor.quitting_reason() {
                return Verdict::Failed(reason.to_string());
            }
            let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            let tail = monitor.last_lines(5).join("\n");
            Verdict::Failed(format!(
                "Scan process failed with return code {}\n{}",
                code, tail
            ))
        }
    }
}

/// Truncates to at most `max` characters.
pub fn truncate_message(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Engine instance identity
///
/// Workspaces and containers are tagged with the engine that owns them so a
/// restarted engine can tell leftovers of a dead one from live work. A pid
/// alone is not enough: the kernel reuses pids, and a restarted engine can
/// come back with the pid of the one that crashed. The identity is therefore
/// `<pid>-<start time>-<tag>`, where the start time is the process start in
/// clock ticks since boot (field 22 of `/proc/<pid>/stat`) and the tag tells
/// apart several engines living in one process.
use std::fmt;
use std::fs;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineInstance {
    pid: u32,
    start_time: u64,
    tag: String,
}

impl EngineInstance {
    /// Identity of a new engine in the current process
    pub fn current() -> Self {
        let pid = std::process::id();
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Self {
            pid,
            start_time: process_start_time(pid).unwrap_or(0),
            tag: tag[..8].to_string(),
        }
    }

    /// Parse a label written by [`EngineInstance::label`]
    pub fn parse(label: &str) -> Option<Self> {
        let mut parts = label.splitn(3, '-');
        let pid = parts.next()?.parse().ok()?;
        let start_time = parts.next()?.parse().ok()?;
        let tag = parts.next()?;
        if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            pid,
            start_time,
            tag: tag.to_string(),
        })
    }

    pub fn label(&self) -> String {
        self.to_string()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True while the process that created this identity is still running.
    /// A reused pid has a different start time and does not count.
    pub fn is_alive(&self) -> bool {
        match process_start_time(self.pid) {
            Some(start_time) => start_time == self.start_time,
            None => false,
        }
    }
}

impl fmt::Display for EngineInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.pid, self.start_time, self.tag)
    }
}

/// Start time of `pid` in clock ticks since boot, `None` if it is not running
pub fn process_start_time(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_start_time(&stat)
}

/// The command name in field 2 may contain spaces and parentheses, so fields
/// are counted from the last ')'.
fn parse_start_time(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // rest starts at field 3 (state); starttime is field 22
    rest.split_whitespace().nth(19)?.parse().ok()
}

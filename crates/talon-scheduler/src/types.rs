use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Where a job was declared. Config jobs are immutable and unremovable;
/// dynamic jobs persist to the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Config,
    Dynamic,
}

/// One scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    /// Duration string: `"30s"`, `"5m"`, `"1h"`, or compounds like `"1h30m"`.
    pub interval: String,
    /// `plugin.action`
    pub action: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// When non-empty, results are delivered to this channel.
    #[serde(default)]
    pub notify_channel: String,
    #[serde(default)]
    pub paused: bool,
    pub source: JobSource,
    #[serde(default)]
    pub created_by: String,
}

impl Job {
    /// Split `plugin.action` on the last dot.
    pub fn split_action(&self) -> Result<(&str, &str)> {
        let pos = self
            .action
            .rfind('.')
            .ok_or_else(|| SchedulerError::InvalidAction(self.action.clone()))?;
        let (plugin, action) = (&self.action[..pos], &self.action[pos + 1..]);
        if plugin.is_empty() || action.is_empty() {
            return Err(SchedulerError::InvalidAction(self.action.clone()));
        }
        Ok((plugin, action))
    }
}

/// Parse a duration string: one or more `<number><unit>` segments with
/// units `ms`, `s`, `m`, `h`.
pub fn parse_interval(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SchedulerError::InvalidInterval(s.to_string()));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| SchedulerError::InvalidInterval(s.to_string()))?;
        if digits_end == 0 {
            return Err(SchedulerError::InvalidInterval(s.to_string()));
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| SchedulerError::InvalidInterval(s.to_string()))?;
        rest = &rest[digits_end..];

        let (unit_len, unit_ms) = if rest.starts_with("ms") {
            (2, 1)
        } else if rest.starts_with('s') {
            (1, 1_000)
        } else if rest.starts_with('m') {
            (1, 60_000)
        } else if rest.starts_with('h') {
            (1, 3_600_000)
        } else {
            return Err(SchedulerError::InvalidInterval(s.to_string()));
        };
        rest = &rest[unit_len..];
        total += Duration::from_millis(value * unit_ms);
    }

    if total.is_zero() {
        return Err(SchedulerError::InvalidInterval(s.to_string()));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_intervals() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_interval("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn parse_compound_interval() {
        assert_eq!(parse_interval("1h30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "fast", "10", "s30", "5x", "0s"] {
            assert!(parse_interval(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn split_action_on_last_dot() {
        let job = Job {
            name: "j".into(),
            interval: "1m".into(),
            action: "com.example.tools.run".into(),
            args: BTreeMap::new(),
            notify_channel: String::new(),
            paused: false,
            source: JobSource::Dynamic,
            created_by: String::new(),
        };
        assert_eq!(job.split_action().unwrap(), ("com.example.tools", "run"));
    }
}

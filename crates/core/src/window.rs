//! Time-of-day request windows.
//!
//! Operators can restrict *when* the worker asks the server for new
//! jobs (not when it finishes them) with a comma-separated list of
//! `HH:MM-HH:MM` intervals in local time. An empty list means requests
//! are always allowed.

use chrono::NaiveTime;

use crate::error::CoreError;

/// One `start-end` interval during which job requests are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl RequestWindow {
    /// Whether `time` falls inside this window (inclusive start,
    /// exclusive end).
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time < self.end
    }
}

/// Parse a `HH:MM-HH:MM[,...]` specification into windows.
///
/// Each interval must have `start < end`; windows crossing midnight are
/// rejected (split them into two intervals instead).
pub fn parse_windows(spec: &str) -> Result<Vec<RequestWindow>, CoreError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    let mut windows = Vec::new();
    for interval in spec.split(',') {
        let (start_str, end_str) = interval.trim().split_once('-').ok_or_else(|| {
            CoreError::Validation(format!("Request window '{interval}' is not 'HH:MM-HH:MM'"))
        })?;

        let start = parse_time(start_str)?;
        let end = parse_time(end_str)?;

        if start >= end {
            return Err(CoreError::Validation(format!(
                "Request window start {start_str} is not before end {end_str}"
            )));
        }

        windows.push(RequestWindow { start, end });
    }
    Ok(windows)
}

/// Whether fetching is currently allowed. An empty window list always
/// allows it.
pub fn fetch_allowed(windows: &[RequestWindow], now: NaiveTime) -> bool {
    windows.is_empty() || windows.iter().any(|w| w.contains(now))
}

fn parse_time(s: &str) -> Result<NaiveTime, CoreError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| CoreError::Validation(format!("Invalid time '{s}', expected HH:MM")))
}

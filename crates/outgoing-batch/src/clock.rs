//! Clocks and per-node UTC offsets.
//!
//! Channel windows are checked against the target node's wall clock, so the
//! selector needs both "now" and the offset the node reported.

use chrono::{DateTime, FixedOffset, Local, Offset, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a settable instant.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// UTC offsets reported by remote nodes.
#[derive(Debug, Clone)]
pub struct NodeClock {
    offsets: HashMap<String, FixedOffset>,
    default_offset: FixedOffset,
}

impl Default for NodeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeClock {
    /// Unknown nodes use this host's local offset.
    pub fn new() -> Self {
        Self {
            offsets: HashMap::new(),
            default_offset: Local::now().offset().fix(),
        }
    }

    pub fn with_default_offset(mut self, offset: FixedOffset) -> Self {
        self.default_offset = offset;
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>, offset: FixedOffset) -> Self {
        self.set_offset(node_id, offset);
        self
    }

    pub fn set_offset(&mut self, node_id: impl Into<String>, offset: FixedOffset) {
        self.offsets.insert(node_id.into(), offset);
    }

    pub fn offset_for(&self, node_id: &str) -> FixedOffset {
        self.offsets
            .get(node_id)
            .copied()
            .unwrap_or(self.default_offset)
    }

    /// `clock`'s current instant on the node's wall clock.
    pub fn now_for(&self, clock: &dyn Clock, node_id: &str) -> DateTime<FixedOffset> {
        clock.now().with_timezone(&self.offset_for(node_id))
    }
}

/// Parses a `+HH:MM`, `-HH:MM`, `+HHMM` or `Z` offset.
pub fn parse_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("+02:00"), FixedOffset::east_opt(7200));
        assert_eq!(parse_offset("-0530"), FixedOffset::east_opt(-19800));
        assert_eq!(parse_offset("Z"), FixedOffset::east_opt(0));
        assert_eq!(parse_offset("02:00"), None);
        assert_eq!(parse_offset("+2:00"), None);
        assert_eq!(parse_offset("+02:75"), None);
    }

    #[test]
    fn test_now_for_uses_node_offset() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let nodes = NodeClock::new()
            .with_default_offset(FixedOffset::east_opt(0).unwrap())
            .with_node("tokyo", FixedOffset::east_opt(9 * 3600).unwrap());
        assert_eq!(nodes.now_for(&clock, "tokyo").hour(), 21);
        assert_eq!(nodes.now_for(&clock, "elsewhere").hour(), 12);

        clock.set(Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap());
        assert_eq!(nodes.now_for(&clock, "tokyo").hour(), 1);
    }
}

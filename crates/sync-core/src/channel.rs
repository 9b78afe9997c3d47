//! Channels: named lanes of replication traffic.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Time-of-day window during which a channel may send.
///
/// The window covers `[start_time, end_time)`; when `start_time > end_time`
/// it wraps past midnight. An empty `days` list means every day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelWindow {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default)]
    pub days: Vec<Weekday>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ChannelWindow {
    pub fn new(start_time: NaiveTime, end_time: NaiveTime) -> Self {
        Self {
            start_time,
            end_time,
            days: Vec::new(),
            enabled: true,
        }
    }

    pub fn on_days(mut self, days: Vec<Weekday>) -> Self {
        self.days = days;
        self
    }

    /// Whether `now`, read in its own offset, falls in this window.
    pub fn contains(&self, now: &DateTime<FixedOffset>) -> bool {
        let time = now.time();
        let weekday = now.weekday();
        if self.start_time <= self.end_time {
            self.day_allowed(weekday) && time >= self.start_time && time < self.end_time
        } else if time >= self.start_time {
            self.day_allowed(weekday)
        } else if time < self.end_time {
            // Early-morning part of a window opened the previous evening.
            self.day_allowed(weekday.pred())
        } else {
            false
        }
    }

    fn day_allowed(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }
}

/// Channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    /// Lower values are selected first.
    #[serde(default)]
    pub processing_order: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_batch_to_send")]
    pub max_batch_to_send: usize,
    #[serde(default)]
    pub windows: Vec<ChannelWindow>,
}

fn default_max_batch_to_send() -> usize {
    100
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, processing_order: i32) -> Self {
        Self {
            channel_id: channel_id.into(),
            processing_order,
            enabled: true,
            max_batch_to_send: default_max_batch_to_send(),
            windows: Vec::new(),
        }
    }

    pub fn with_max_batch_to_send(mut self, max: usize) -> Self {
        self.max_batch_to_send = max;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_window(mut self, window: ChannelWindow) -> Self {
        self.windows.push(window);
        self
    }

    /// A channel without enabled windows is always open.
    pub fn in_window(&self, now: &DateTime<FixedOffset>) -> bool {
        let mut enabled = self.windows.iter().filter(|w| w.enabled).peekable();
        if enabled.peek().is_none() {
            return true;
        }
        enabled.any(|w| w.contains(now))
    }
}

/// Orders channels for selection: processing order, then id.
pub fn sort_channels(channels: &mut [Channel]) {
    channels.sort_by(|a, b| {
        a.processing_order
            .cmp(&b.processing_order)
            .then_with(|| a.channel_id.cmp(&b.channel_id))
    });
}

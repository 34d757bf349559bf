//! Buffered execution logs addressed by log channel id.
//!
//! Line numbers are absolute per channel and never reused: dropping old
//! lines (line limit or retention) does not shift the numbering, so a
//! client polling with `from = last_line` never sees a line twice.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, TimeDelta, Utc};
use sluice_protocol::{configuration::LogLevel, status::LogChunk};
use tracing::debug;

#[derive(Debug, Clone)]
struct LogLine {
    timestamp: DateTime<Utc>,
    text: String,
}

#[derive(Debug, Default)]
struct Channel {
    lines: VecDeque<LogLine>,
    /// Absolute number of the next line to be appended
    next_line: u64,
}

impl Channel {
    fn first_line(&self) -> u64 {
        self.next_line - self.lines.len() as u64
    }
}

/// In-memory log buffer shared by all executions of a node
#[derive(Debug)]
pub struct LogStore {
    channels: Mutex<HashMap<String, Channel>>,
    max_lines: usize,
    retention: Option<TimeDelta>,
}

impl LogStore {
    /// `max_lines` is the limit per channel; `retention` drops older lines on [`LogStore::trim_expired`]
    pub fn new(max_lines: usize, retention: Option<TimeDelta>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            max_lines: max_lines.max(1),
            retention,
        }
    }

    /// Append a line, returning its absolute line number
    pub fn append(&self, channel: &str, level: LogLevel, message: impl AsRef<str>) -> u64 {
        let timestamp = Utc::now();
        let text = format!(
            "{} - {:?} - {}",
            timestamp.format("%Y/%m/%d %H:%M:%S"),
            level,
            message.as_ref()
        );

        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = channels.entry(channel.to_string()).or_default();

        buffer.lines.push_back(LogLine { timestamp, text });
        while buffer.lines.len() > self.max_lines {
            buffer.lines.pop_front();
        }

        let number = buffer.next_line;
        buffer.next_line += 1;
        number
    }

    /// Lines of a channel from absolute line `from` onward.
    ///
    /// Unknown channels yield an empty chunk positioned at `from`.
    pub fn lines_from(&self, channel: &str, from: u64) -> LogChunk {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(buffer) = channels.get(channel) else {
            return LogChunk {
                first_line: from,
                last_line: from,
                lines: vec![],
            };
        };

        let first_line = from.max(buffer.first_line()).min(buffer.next_line);
        let skip = (first_line - buffer.first_line()) as usize;
        let lines = buffer
            .lines
            .iter()
            .skip(skip)
            .map(|line| line.text.clone())
            .collect();

        LogChunk {
            first_line,
            last_line: buffer.next_line,
            lines,
        }
    }

    /// Drop every line of a channel. Returns whether the channel existed.
    pub fn discard(&self, channel: &str) -> bool {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel)
            .is_some();

        if removed {
            debug!(log_channel = %channel, "Discarded execution log");
        }
        removed
    }

    /// Drop lines older than the retention window, returning how many were dropped
    pub fn trim_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let cutoff = now - retention;

        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = 0;
        for buffer in channels.values_mut() {
            while buffer
                .lines
                .front()
                .is_some_and(|line| line.timestamp < cutoff)
            {
                buffer.lines.pop_front();
                dropped += 1;
            }
        }

        dropped
    }

    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

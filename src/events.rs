//! A short rolling journal of protocol events for the admin console.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

/// Events older than this are dropped.
const RETENTION_HOURS: i64 = 24;

/// Upper bound on retained events, whatever their age.
const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.message)
    }
}

#[derive(Debug)]
pub struct EventLog {
    events: Mutex<VecDeque<Event>>,
    retention: TimeDelta,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(TimeDelta::hours(RETENTION_HOURS), DEFAULT_CAPACITY)
    }
}

impl EventLog {
    pub fn new(retention: TimeDelta, capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            retention,
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, message: impl Into<String>) {
        self.record_at(Utc::now(), message);
    }

    pub fn record_at(&self, at: DateTime<Utc>, message: impl Into<String>) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_back(Event {
            at,
            message: message.into(),
        });
        while events.len() > self.capacity {
            events.pop_front();
        }
        Self::prune(&mut events, at - self.retention);
    }

    /// Events still inside the retention window at `now`, oldest first.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<Event> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut events, now - self.retention);
        events.iter().cloned().collect()
    }

    fn prune(events: &mut VecDeque<Event>, cutoff: DateTime<Utc>) {
        while events.front().is_some_and(|event| event.at <= cutoff) {
            events.pop_front();
        }
    }
}

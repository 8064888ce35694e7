//! Link statistics shared between apps through the `stats` context.

use parking_lot::Mutex;
use serde::Serialize;

pub const STATS_CONTEXT: &str = "stats";

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub heartbeats: u64,
    pub ports_up: u64,
    pub ports_down: u64,
}

#[derive(Debug, Default)]
pub struct LinkStats {
    counters: Mutex<StatsSnapshot>,
}

impl LinkStats {
    pub fn record_heartbeat(&self) {
        self.counters.lock().heartbeats += 1;
    }

    pub fn record_port(&self, up: bool) {
        let mut counters = self.counters.lock();
        if up {
            counters.ports_up += 1;
        } else {
            counters.ports_down += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.counters.lock()
    }
}

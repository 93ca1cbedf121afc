//! State tracker: the authoritative in-memory per-slug status cache.
//!
//! Storage writes are buffered and may lag, so transition detection reads
//! this cache, never a fresh storage row.

use std::collections::HashMap;

use crate::db::{CheckResult, MonitorState, Status};

/// What a recorded result did to a monitor's classified status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub previous: Option<Status>,
    /// True iff the status differs from the previous observation. Always
    /// false on the first observation for a slug.
    pub changed: bool,
}

/// Per-slug status and counters, rebuilt from storage at startup.
#[derive(Default)]
pub struct StateTracker {
    states: HashMap<String, MonitorState>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache from persisted state rows.
    pub fn load(&mut self, states: HashMap<String, MonitorState>) {
        self.states = states;
    }

    /// Fold one completed check into the cache and report the transition.
    pub fn record(&mut self, slug: &str, result: &CheckResult) -> Transition {
        match self.states.get_mut(slug) {
            None => {
                let (up, down) = match result.status {
                    Status::Up => (1, 0),
                    Status::Down => (0, 1),
                };
                self.states.insert(
                    slug.to_string(),
                    MonitorState {
                        current_status: result.status,
                        last_checked: result.checked_at,
                        uptime_count: up,
                        downtime_count: down,
                    },
                );
                Transition {
                    previous: None,
                    changed: false,
                }
            }
            Some(state) => {
                let previous = state.current_status;
                match result.status {
                    Status::Up => state.uptime_count += 1,
                    Status::Down => state.downtime_count += 1,
                }
                state.current_status = result.status;
                state.last_checked = result.checked_at;
                Transition {
                    previous: Some(previous),
                    changed: previous != result.status,
                }
            }
        }
    }

    pub fn get(&self, slug: &str) -> Option<&MonitorState> {
        self.states.get(slug)
    }

    /// Drop state for a removed monitor definition.
    pub fn remove(&mut self, slug: &str) {
        self.states.remove(slug);
    }
}

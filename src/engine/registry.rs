//! In-memory monitor registry: the scheduled reflection of the persisted
//! monitor definitions, reconciled periodically against the store.

use rand::Rng;
use std::collections::{HashMap, HashSet};

use crate::db::MonitorDefinition;

/// Random offset cap when a monitor's interval changes, so the new cadence
/// takes effect promptly without a stampede.
const INTERVAL_CHANGE_JITTER_MS: i64 = 1_000;

/// How soon an edited monitor (target/name/type change) is re-checked.
const EDIT_PULL_FORWARD_MS: i64 = 1_000;

/// A monitor definition plus its scheduling state.
#[derive(Debug, Clone)]
pub struct ScheduledMonitor {
    pub def: MonitorDefinition,
    /// Epoch milliseconds of the next due run.
    pub next_run_at: i64,
}

/// Registry of scheduled monitors, keyed by slug. Owned and mutated only by
/// the engine's single loop task.
#[derive(Default)]
pub struct Registry {
    monitors: HashMap<String, ScheduledMonitor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the registry in line with the latest definitions.
    ///
    /// First-seen monitors get a startup jitter offset; an interval change
    /// re-jitters with a short cap; a target/name/type edit pulls the next
    /// run forward without discarding timer alignment. Returns the slugs of
    /// monitors that disappeared so the caller can drop their state.
    pub fn reconcile(
        &mut self,
        definitions: Vec<MonitorDefinition>,
        now: i64,
        startup_jitter_max_ms: i64,
        min_interval_ms: i64,
        max_interval_ms: i64,
    ) -> Vec<String> {
        let seen: HashSet<&str> = definitions.iter().map(|d| d.slug.as_str()).collect();

        let removed: Vec<String> = self
            .monitors
            .keys()
            .filter(|slug| !seen.contains(slug.as_str()))
            .cloned()
            .collect();
        for slug in &removed {
            self.monitors.remove(slug);
            tracing::info!("Registry: removed monitor {}", slug);
        }

        for mut def in definitions {
            def.interval_ms = def.interval_ms.clamp(min_interval_ms, max_interval_ms);

            match self.monitors.get_mut(&def.slug) {
                None => {
                    let cap = def.interval_ms.min(startup_jitter_max_ms).max(0);
                    let next_run_at = now + jitter(cap);
                    tracing::info!("Registry: adding monitor {}", def.slug);
                    self.monitors.insert(
                        def.slug.clone(),
                        ScheduledMonitor { def, next_run_at },
                    );
                }
                Some(existing) => {
                    if existing.def.interval_ms != def.interval_ms {
                        let cap = def.interval_ms.min(INTERVAL_CHANGE_JITTER_MS).max(0);
                        existing.next_run_at = now + jitter(cap);
                    } else if existing.def != def {
                        existing.next_run_at =
                            existing.next_run_at.min(now + EDIT_PULL_FORWARD_MS);
                    }
                    existing.def = def;
                }
            }
        }

        removed
    }

    /// Monitors whose next run is due. Order is arbitrary.
    pub fn due(&self, now: i64) -> Vec<ScheduledMonitor> {
        self.monitors
            .values()
            .filter(|m| m.next_run_at <= now)
            .cloned()
            .collect()
    }

    /// Advance a monitor's next run by its interval after dispatch.
    pub fn mark_dispatched(&mut self, slug: &str, now: i64) {
        if let Some(m) = self.monitors.get_mut(slug) {
            m.next_run_at = now + m.def.interval_ms;
        }
    }

    /// Force a monitor to run on the next tick. Returns false when the
    /// slug is not scheduled.
    pub fn refresh_now(&mut self, slug: &str, now: i64) -> bool {
        match self.monitors.get_mut(slug) {
            Some(m) => {
                m.next_run_at = now;
                true
            }
            None => false,
        }
    }

    /// Force every monitor to run on the next tick.
    pub fn refresh_all_now(&mut self, now: i64) {
        for m in self.monitors.values_mut() {
            m.next_run_at = now;
        }
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.monitors.contains_key(slug)
    }

    pub fn get(&self, slug: &str) -> Option<&ScheduledMonitor> {
        self.monitors.get(slug)
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }
}

fn jitter(cap_ms: i64) -> i64 {
    if cap_ms <= 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=cap_ms)
}

//! The monitor scheduling and execution engine.
//!
//! One spawned task owns every mutable structure (registry, state tracker,
//! running set, buffer) and drives a short repeating tick: reconcile the
//! registry on its cadence, run retention cleanup on its cadence, dispatch
//! due checks up to the concurrency ceiling. Checks run as independent
//! tasks and report completions back over a channel into the same loop, so
//! no locking is needed around the maps.

mod buffer;
mod registry;
mod state;

pub use buffer::*;
pub use registry::*;
pub use state::*;

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::check::run_check;
use crate::config::{MonitoringConfig, Settings};
use crate::db::{BufferedRecord, CheckResult, DbError, MonitorDefinition, Status, Store};
use crate::guard::SafetyGuard;
use crate::notify::Notifier;

/// Engine error types.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("engine is not running")]
    NotRunning,
}

enum Command {
    RefreshMonitor(String),
    RefreshAll,
    Stop(oneshot::Sender<()>),
}

struct Completion {
    slug: String,
    result: CheckResult,
}

/// A state-change the loop hands off to the notifier, fire-and-forget.
struct NotificationEvent {
    monitor: MonitorDefinition,
    new_status: Status,
    response_time_ms: Option<i64>,
}

/// Control handle for the engine loop task.
pub struct Engine {
    cmd_tx: mpsc::Sender<Command>,
}

impl Engine {
    /// Replay any buffered results from a previous run, seed the state
    /// tracker from storage, and spawn the tick loop.
    pub fn start<N: Notifier>(
        store: Store,
        data_dir: &str,
        settings: Arc<Settings>,
        notifier: Arc<N>,
    ) -> Result<Self, EngineError> {
        let buffer = ResultBuffer::new(data_dir)?;
        match buffer.flush(&store) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Engine: replayed {} buffered results from previous run", n),
            Err(e) => tracing::warn!("Engine: startup replay failed, will retry on flush: {}", e),
        }

        let mut tracker = StateTracker::new();
        tracker.load(store.load_states()?);

        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let monitor_loop = EngineLoop {
            store,
            settings,
            notifier,
            guard: Arc::new(SafetyGuard::default()),
            buffer,
            registry: Registry::new(),
            tracker,
            running: HashSet::new(),
            last_sync: None,
            last_cleanup: None,
        };
        tokio::spawn(monitor_loop.run(cmd_rx));

        Ok(Self { cmd_tx })
    }

    /// Stop the loop. Awaits the final buffer flush; in-flight checks are
    /// not cancelled.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Force a monitor's next run to now, after a create or edit.
    pub async fn refresh_monitor_now(&self, slug: &str) -> Result<(), EngineError> {
        self.cmd_tx
            .send(Command::RefreshMonitor(slug.to_string()))
            .await
            .map_err(|_| EngineError::NotRunning)
    }

    /// Force every monitor's next run to now.
    pub async fn refresh_all_now(&self) -> Result<(), EngineError> {
        self.cmd_tx
            .send(Command::RefreshAll)
            .await
            .map_err(|_| EngineError::NotRunning)
    }
}

struct EngineLoop<N: Notifier> {
    store: Store,
    settings: Arc<Settings>,
    notifier: Arc<N>,
    guard: Arc<SafetyGuard>,
    buffer: ResultBuffer,
    registry: Registry,
    tracker: StateTracker,
    /// Slugs with a check currently in flight.
    running: HashSet<String>,
    last_sync: Option<Instant>,
    last_cleanup: Option<Instant>,
}

impl<N: Notifier> EngineLoop<N> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let cfg = self.settings.monitoring();
        tracing::info!(
            "Engine: starting tick loop ({}ms tick, concurrency {})",
            cfg.tick_interval_ms,
            cfg.max_concurrency
        );

        let mut tick = tokio::time::interval(Duration::from_millis(cfg.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut flush_tick = tokio::time::interval(Duration::from_millis(cfg.flush_interval_ms));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(1024);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let cfg = self.tick(&done_tx);
                    if let Some(next) = resized_interval(tick.period(), cfg.tick_interval_ms) {
                        tracing::info!("Engine: tick interval now {}ms", cfg.tick_interval_ms);
                        tick = next;
                    }
                    if let Some(next) = resized_interval(flush_tick.period(), cfg.flush_interval_ms) {
                        tracing::info!("Engine: flush interval now {}ms", cfg.flush_interval_ms);
                        flush_tick = next;
                    }
                }
                Some(done) = done_rx.recv() => {
                    if let Some(event) = self.handle_completion(done) {
                        self.spawn_notification(event);
                    }
                }
                _ = flush_tick.tick() => {
                    if let Err(e) = self.buffer.flush(&self.store) {
                        tracing::warn!("Engine: flush failed, keeping buffer for retry: {}", e);
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::RefreshMonitor(slug)) => {
                            self.refresh_monitor(&slug);
                        }
                        Some(Command::RefreshAll) => {
                            self.registry.refresh_all_now(Utc::now().timestamp_millis());
                        }
                        Some(Command::Stop(ack)) => {
                            self.shutdown();
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// One scheduler tick. Errors are contained here: a failed tick is
    /// logged and the next one proceeds on schedule. Returns the settings
    /// in effect so the loop can resize its intervals.
    fn tick(&mut self, done_tx: &mpsc::Sender<Completion>) -> MonitoringConfig {
        let cfg = self.settings.monitoring();
        let now = Utc::now().timestamp_millis();

        if elapsed(self.last_sync, cfg.sync_interval_ms) {
            self.reconcile(now, &cfg);
            self.last_sync = Some(Instant::now());
        }

        if elapsed(self.last_cleanup, cfg.cleanup_interval_ms) {
            self.cleanup(&cfg);
            self.last_cleanup = Some(Instant::now());
        }

        let due = self.registry.due(now);
        let selected: Vec<ScheduledMonitor> =
            select_for_dispatch(&due, &self.running, cfg.max_concurrency)
                .into_iter()
                .cloned()
                .collect();

        for sched in selected {
            self.registry.mark_dispatched(&sched.def.slug, now);
            self.running.insert(sched.def.slug.clone());
            self.spawn_check(sched.def, cfg.clone(), done_tx.clone());
        }

        cfg
    }

    /// Pull a monitor's next run forward to now. A slug the registry has
    /// not seen yet is a just-created monitor; reconcile immediately so the
    /// refresh lands instead of waiting out the sync cadence.
    fn refresh_monitor(&mut self, slug: &str) {
        let now = Utc::now().timestamp_millis();
        if self.registry.refresh_now(slug, now) {
            return;
        }

        let cfg = self.settings.monitoring();
        self.reconcile(now, &cfg);
        self.last_sync = Some(Instant::now());
        if !self.registry.refresh_now(slug, now) {
            tracing::debug!("Engine: refresh requested for unknown monitor {}", slug);
        }
    }

    fn reconcile(&mut self, now: i64, cfg: &MonitoringConfig) {
        match self.store.get_monitors() {
            Ok(definitions) => {
                let removed = self.registry.reconcile(
                    definitions,
                    now,
                    cfg.startup_jitter_max_ms,
                    cfg.min_interval_ms,
                    cfg.max_interval_ms,
                );
                for slug in removed {
                    self.tracker.remove(&slug);
                }
                tracing::debug!("Engine: registry reconciled, {} monitors", self.registry.len());
            }
            Err(e) => {
                tracing::warn!("Engine: reconcile failed, keeping stale registry: {}", e);
            }
        }
    }

    fn cleanup(&self, cfg: &MonitoringConfig) {
        let cutoff = Utc::now() - chrono::Duration::days(cfg.retention_days);
        match self.store.purge_results_before(cutoff) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Engine: purged {} check results past retention", n),
            Err(e) => tracing::error!("Engine: retention cleanup failed: {}", e),
        }
    }

    fn spawn_check(
        &self,
        def: MonitorDefinition,
        cfg: MonitoringConfig,
        done_tx: mpsc::Sender<Completion>,
    ) {
        let guard = self.guard.clone();
        tokio::spawn(async move {
            let blocked = cfg.block_private_ips && guard.is_blocked(&def).await;
            let result = if blocked {
                tracing::warn!("Engine: target for {} is blocked, recording DOWN", def.slug);
                CheckResult {
                    status: Status::Down,
                    response_time_ms: None,
                    status_code: None,
                    details: None,
                    checked_at: Utc::now(),
                }
            } else {
                run_check(&def, &cfg).await
            };

            let _ = done_tx
                .send(Completion {
                    slug: def.slug,
                    result,
                })
                .await;
        });
    }

    /// Fold a completed check back into the loop's state. Returns the
    /// notification to dispatch when the status transitioned.
    fn handle_completion(&mut self, done: Completion) -> Option<NotificationEvent> {
        self.running.remove(&done.slug);

        // A completion for a monitor deleted mid-flight must not resurrect
        // its state.
        let Some(sched) = self.registry.get(&done.slug) else {
            tracing::debug!("Engine: dropping result for removed monitor {}", done.slug);
            return None;
        };
        let monitor = sched.def.clone();

        let transition = self.tracker.record(&done.slug, &done.result);

        let record = BufferedRecord::new(&done.slug, &done.result);
        if let Err(e) = self.buffer.append(&record) {
            tracing::error!("Engine: failed to stage result for {}: {}", done.slug, e);
        }

        if transition.changed {
            tracing::info!(
                "Engine: {} transitioned {:?} -> {}",
                done.slug,
                transition.previous,
                done.result.status
            );
            return Some(NotificationEvent {
                monitor,
                new_status: done.result.status,
                response_time_ms: done.result.response_time_ms,
            });
        }
        None
    }

    fn spawn_notification(&self, event: NotificationEvent) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier
                .notify_state_change(event.monitor, event.new_status, event.response_time_ms)
                .await;
        });
    }

    fn shutdown(&mut self) {
        tracing::info!("Engine: stopping, flushing {} pending results", self.buffer.pending());
        if let Err(e) = self.buffer.flush(&self.store) {
            tracing::error!("Engine: final flush failed, buffer kept on disk: {}", e);
        }
    }
}

/// A replacement interval when the configured period differs from the one
/// currently in use. The first tick of the new interval lands one full
/// period out, not immediately.
fn resized_interval(current: Duration, new_ms: u64) -> Option<tokio::time::Interval> {
    let period = Duration::from_millis(new_ms);
    if new_ms == 0 || period == current {
        return None;
    }
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    Some(interval)
}

fn elapsed(last: Option<Instant>, interval_ms: u64) -> bool {
    match last {
        None => true,
        Some(at) => at.elapsed() >= Duration::from_millis(interval_ms),
    }
}

/// Pick which due monitors to dispatch this tick: skip any slug already in
/// flight, and take no more than the free slots under the ceiling.
fn select_for_dispatch<'a>(
    due: &'a [ScheduledMonitor],
    running: &HashSet<String>,
    max_concurrency: usize,
) -> Vec<&'a ScheduledMonitor> {
    let free = max_concurrency.saturating_sub(running.len());
    due.iter()
        .filter(|m| !running.contains(&m.def.slug))
        .take(free)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MonitorType;
    use crate::notify::testing::RecordingNotifier;
    use tempfile::tempdir;

    fn def(slug: &str) -> MonitorDefinition {
        MonitorDefinition {
            slug: slug.to_string(),
            name: slug.to_string(),
            monitor_type: MonitorType::Http,
            target: format!("https://{}.example.com", slug),
            interval_ms: 10_000,
        }
    }

    fn sched(slug: &str) -> ScheduledMonitor {
        ScheduledMonitor {
            def: def(slug),
            next_run_at: 0,
        }
    }

    fn result(status: Status) -> CheckResult {
        CheckResult {
            status,
            response_time_ms: Some(25),
            status_code: Some(200),
            details: None,
            checked_at: Utc::now(),
        }
    }

    fn test_loop(dir: &std::path::Path) -> EngineLoop<RecordingNotifier> {
        let store = Store::new(dir.join("test.db")).unwrap();
        let settings = Arc::new(Settings::new(store.clone()));
        EngineLoop {
            store,
            settings,
            notifier: Arc::new(RecordingNotifier::default()),
            guard: Arc::new(SafetyGuard::default()),
            buffer: ResultBuffer::new(dir).unwrap(),
            registry: Registry::new(),
            tracker: StateTracker::new(),
            running: HashSet::new(),
            last_sync: None,
            last_cleanup: None,
        }
    }

    #[tokio::test]
    async fn test_interval_resizes_only_on_change() {
        assert!(resized_interval(Duration::from_millis(500), 500).is_none());
        assert!(resized_interval(Duration::from_millis(500), 0).is_none());
        let next = resized_interval(Duration::from_millis(500), 50).unwrap();
        assert_eq!(next.period(), Duration::from_millis(50));
    }

    #[test]
    fn test_select_respects_concurrency_ceiling() {
        let due = vec![sched("a"), sched("b"), sched("c")];
        let running = HashSet::new();

        let selected = select_for_dispatch(&due, &running, 2);
        assert_eq!(selected.len(), 2);

        let selected = select_for_dispatch(&due, &running, 5);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_select_counts_in_flight_checks_against_ceiling() {
        let due = vec![sched("a"), sched("b")];
        let mut running = HashSet::new();
        running.insert("x".to_string());
        running.insert("y".to_string());

        assert!(select_for_dispatch(&due, &running, 2).is_empty());
        assert_eq!(select_for_dispatch(&due, &running, 3).len(), 1);
    }

    #[test]
    fn test_select_skips_slug_already_in_flight() {
        let due = vec![sched("a"), sched("b")];
        let mut running = HashSet::new();
        running.insert("a".to_string());

        let selected = select_for_dispatch(&due, &running, 5);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].def.slug, "b");
    }

    #[tokio::test]
    async fn test_first_result_then_transition() {
        let dir = tempdir().unwrap();
        let mut engine = test_loop(dir.path());
        engine.registry.reconcile(
            vec![def("m1")],
            0,
            0,
            10_000,
            3_600_000,
        );
        engine.running.insert("m1".to_string());

        // First observation: state initialized, no notification.
        let event = engine.handle_completion(Completion {
            slug: "m1".to_string(),
            result: result(Status::Up),
        });
        assert!(event.is_none());
        let state = engine.tracker.get("m1").unwrap();
        assert_eq!(state.current_status, Status::Up);
        assert_eq!(state.uptime_count, 1);
        assert!(!engine.running.contains("m1"));

        // Second check flips to DOWN: counters advance and a notification
        // event is produced.
        engine.running.insert("m1".to_string());
        let event = engine.handle_completion(Completion {
            slug: "m1".to_string(),
            result: result(Status::Down),
        });
        let event = event.expect("transition should notify");
        assert_eq!(event.new_status, Status::Down);
        assert_eq!(event.monitor.slug, "m1");
        assert_eq!(event.response_time_ms, Some(25));

        let state = engine.tracker.get("m1").unwrap();
        assert_eq!(state.uptime_count, 1);
        assert_eq!(state.downtime_count, 1);

        // Both results were staged durably.
        assert_eq!(engine.buffer.pending(), 2);
    }

    #[tokio::test]
    async fn test_steady_state_repeat_does_not_notify() {
        let dir = tempdir().unwrap();
        let mut engine = test_loop(dir.path());
        engine
            .registry
            .reconcile(vec![def("m1")], 0, 0, 10_000, 3_600_000);

        for _ in 0..3 {
            let event = engine.handle_completion(Completion {
                slug: "m1".to_string(),
                result: result(Status::Up),
            });
            assert!(event.is_none());
        }
    }

    #[tokio::test]
    async fn test_completion_for_removed_monitor_is_dropped() {
        let dir = tempdir().unwrap();
        let mut engine = test_loop(dir.path());
        engine.running.insert("ghost".to_string());

        let event = engine.handle_completion(Completion {
            slug: "ghost".to_string(),
            result: result(Status::Up),
        });
        assert!(event.is_none());
        assert!(engine.tracker.get("ghost").is_none());
        assert_eq!(engine.buffer.pending(), 0);
        assert!(!engine.running.contains("ghost"));
    }

    #[tokio::test]
    async fn test_refresh_for_unsynced_monitor_reconciles_first() {
        let dir = tempdir().unwrap();
        let mut engine = test_loop(dir.path());
        engine
            .store
            .add_monitor(&def("m1"), 10_000, 3_600_000)
            .unwrap();
        assert!(!engine.registry.contains("m1"));

        // A refresh right after creation must not wait out the sync cadence.
        engine.refresh_monitor("m1");
        let now = Utc::now().timestamp_millis();
        let sched = engine.registry.get("m1").expect("monitor should be scheduled");
        assert!(sched.next_run_at <= now);
    }

    #[tokio::test]
    async fn test_reconcile_failure_keeps_stale_registry() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let mut engine = test_loop(dir.path());
        engine
            .store
            .add_monitor(&def("m1"), 10_000, 3_600_000)
            .unwrap();
        let cfg = MonitoringConfig::default();
        engine.reconcile(0, &cfg);
        assert_eq!(engine.registry.len(), 1);

        {
            let raw = rusqlite::Connection::open(&db_path).unwrap();
            raw.execute_batch("DROP TABLE monitors").unwrap();
        }
        engine.reconcile(1_000, &cfg);
        assert_eq!(engine.registry.len(), 1);
        assert!(engine.registry.contains("m1"));
    }

    #[tokio::test]
    async fn test_engine_runs_a_check_end_to_end() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db")).unwrap();
        let settings = Arc::new(Settings::new(store.clone()));

        // Fast cadence, no jitter, private targets allowed (the check
        // points at a loopback listener).
        let mut cfg = MonitoringConfig::default();
        cfg.tick_interval_ms = 20;
        cfg.sync_interval_ms = 20;
        cfg.startup_jitter_max_ms = 0;
        cfg.block_private_ips = false;
        settings.update(&cfg).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut monitor = def("tcp-local");
        monitor.monitor_type = MonitorType::Tcp;
        monitor.target = addr.to_string();
        store.add_monitor(&monitor, 10_000, 3_600_000).unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let data_dir = dir.path().join("data");
        let engine = Engine::start(
            store.clone(),
            data_dir.to_str().unwrap(),
            settings,
            notifier.clone(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        // The interval is 10s, so a second check only happens if the
        // refresh command pulls it forward.
        engine.refresh_monitor_now("tcp-local").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.refresh_all_now().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.stop().await;

        // The checks ran, were classified UP, and the final flush
        // persisted them; no transition means no notification.
        let states = store.load_states().unwrap();
        let state = states.get("tcp-local").expect("state should be persisted");
        assert_eq!(state.current_status, Status::Up);
        assert!(state.uptime_count >= 3);
        assert_eq!(store.count_results("tcp-local").unwrap(), state.uptime_count);
        assert!(notifier.events.lock().unwrap().is_empty());
    }
}

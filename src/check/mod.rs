//! Check strategies: one probe implementation per monitor type.
//!
//! Every failure mode resolves to a DOWN `CheckResult`; nothing in this
//! module propagates an error back into the tick loop.

mod game;
mod http;
mod ping;
mod tcp;

pub use game::*;
pub use http::*;
pub use ping::*;
pub use tcp::*;

use chrono::Utc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::MonitoringConfig;
use crate::db::{CheckResult, MonitorDefinition, MonitorType, Status};

/// Check error types.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("check timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Run the monitor's check strategy under the outer watchdog.
///
/// The watchdog grants the strategy its configured timeout plus a fixed
/// margin; a strategy that hangs past that is recorded as DOWN and its
/// worker slot freed, whether or not the underlying I/O ever unblocks.
pub async fn run_check(monitor: &MonitorDefinition, cfg: &MonitoringConfig) -> CheckResult {
    let watchdog = Duration::from_millis(cfg.timeout_ms + cfg.watchdog_margin_ms);
    run_guarded(&monitor.slug, watchdog, dispatch(monitor, cfg)).await
}

async fn run_guarded<F>(slug: &str, watchdog: Duration, strategy: F) -> CheckResult
where
    F: std::future::Future<Output = Result<CheckResult, CheckError>>,
{
    let start = Instant::now();

    match tokio::time::timeout(watchdog, strategy).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::debug!("Check failed for {}: {}", slug, e);
            failure_result(start)
        }
        Err(_) => {
            tracing::warn!(
                "Check for {} exceeded watchdog ({:?}), recording DOWN",
                slug,
                watchdog
            );
            failure_result(start)
        }
    }
}

async fn dispatch(
    monitor: &MonitorDefinition,
    cfg: &MonitoringConfig,
) -> Result<CheckResult, CheckError> {
    match monitor.monitor_type {
        MonitorType::Http => check_http(&monitor.target, cfg).await,
        MonitorType::Tcp => check_tcp(&monitor.target, cfg).await,
        MonitorType::Ping => check_ping(&monitor.target, cfg).await,
        MonitorType::GameServerQuery => check_game_server(&monitor.target, cfg).await,
    }
}

/// DOWN result with the time spent from dispatch to failure.
fn failure_result(start: Instant) -> CheckResult {
    CheckResult {
        status: Status::Down,
        response_time_ms: Some(start.elapsed().as_millis() as i64),
        status_code: None,
        details: None,
        checked_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(monitor_type: MonitorType, target: &str) -> MonitorDefinition {
        MonitorDefinition {
            slug: "m1".to_string(),
            name: "M1".to_string(),
            monitor_type,
            target: target.to_string(),
            interval_ms: 10_000,
        }
    }

    #[tokio::test]
    async fn test_malformed_tcp_target_resolves_to_down() {
        let cfg = MonitoringConfig::default();
        let result = run_check(&monitor(MonitorType::Tcp, "no-port-here"), &cfg).await;
        assert_eq!(result.status, Status::Down);
        assert!(result.response_time_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wedged_strategy_is_cut_off_by_watchdog() {
        // A strategy that never completes: the watchdog must fire and
        // record DOWN on its own.
        let result = run_guarded(
            "m1",
            Duration::from_millis(300),
            std::future::pending::<Result<CheckResult, CheckError>>(),
        )
        .await;
        assert_eq!(result.status, Status::Down);
        assert!(result.response_time_ms.is_some());
        assert!(result.details.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_http_resolves_to_down() {
        let mut cfg = MonitoringConfig::default();
        cfg.timeout_ms = 200;
        cfg.watchdog_margin_ms = 100;
        // Reserved TEST-NET-1 address, guaranteed unroutable.
        let result = run_check(&monitor(MonitorType::Http, "http://192.0.2.1/"), &cfg).await;
        assert_eq!(result.status, Status::Down);
    }
}

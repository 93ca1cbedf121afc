//! Ping check implementation using the platform `ping` command.

use chrono::Utc;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

use super::CheckError;
use crate::config::MonitoringConfig;
use crate::db::{CheckResult, Status};

/// Send one ICMP echo via the platform ping binary.
///
/// UP iff the process exits successfully. The command carries its own
/// timeout; the outer watchdog kills a process that ignores it.
pub async fn check_ping(target: &str, cfg: &MonitoringConfig) -> Result<CheckResult, CheckError> {
    let start = Instant::now();

    let timeout_secs = (cfg.timeout_ms / 1000).max(1).to_string();
    let timeout_ms = cfg.timeout_ms.to_string();

    let args: Vec<&str> = if cfg!(windows) {
        vec!["-n", "1", "-w", &timeout_ms, target]
    } else {
        vec!["-c", "1", "-W", &timeout_secs, target]
    };

    let status = Command::new("ping")
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| CheckError::Command(format!("failed to spawn ping: {}", e)))?;

    Ok(CheckResult {
        status: if status.success() {
            Status::Up
        } else {
            Status::Down
        },
        response_time_ms: Some(start.elapsed().as_millis() as i64),
        status_code: None,
        details: Some(serde_json::json!({
            "type": "ping",
            "target": target,
        })),
        checked_at: Utc::now(),
    })
}

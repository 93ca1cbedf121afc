//! Game-server check implementation.
//!
//! Queries the mcsrvstat.us status API rather than speaking the server
//! protocol directly; the API reports online state, player counts, version
//! and message-of-the-day for a `host[:port]` target.

use chrono::Utc;
use std::time::{Duration, Instant};

use super::CheckError;
use crate::config::MonitoringConfig;
use crate::db::{CheckResult, Status};

const STATUS_API_BASE: &str = "https://api.mcsrvstat.us/2/";

/// Query the status API for the target server.
///
/// UP iff the API reports the server online.
pub async fn check_game_server(
    target: &str,
    cfg: &MonitoringConfig,
) -> Result<CheckResult, CheckError> {
    let timeout = Duration::from_millis(cfg.timeout_ms);

    let mut url = reqwest::Url::parse(STATUS_API_BASE)
        .map_err(|e| CheckError::InvalidTarget(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| CheckError::InvalidTarget("cannot-be-a-base URL".to_string()))?
        .push(target);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CheckError::Network(e.to_string()))?;

    let start = Instant::now();

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            CheckError::Timeout(timeout)
        } else {
            CheckError::Network(e.to_string())
        }
    })?;

    let status_code = response.status().as_u16();
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| CheckError::Network(e.to_string()))?;

    let response_time_ms = start.elapsed().as_millis() as i64;
    let online = body
        .get("online")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    Ok(CheckResult {
        status: if online { Status::Up } else { Status::Down },
        response_time_ms: Some(response_time_ms),
        status_code: Some(status_code),
        details: Some(extract_details(&body)),
        checked_at: Utc::now(),
    })
}

/// Pull the interesting fields out of the API payload when present.
fn extract_details(body: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "type": "game-server-query",
        "playersOnline": body.pointer("/players/online"),
        "playersMax": body.pointer("/players/max"),
        "version": body.get("version"),
        "motd": body.pointer("/motd/clean/0"),
    })
}

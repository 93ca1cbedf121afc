//! TCP connect check implementation.

use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::CheckError;
use crate::config::MonitoringConfig;
use crate::db::{CheckResult, Status};

/// Open a raw connection to `host:port`.
///
/// UP iff the connection succeeds before the timeout. A malformed target,
/// timeout, or connection error all resolve to DOWN rather than an error,
/// mirroring the contract that a probe failure is a result, not a fault.
pub async fn check_tcp(target: &str, cfg: &MonitoringConfig) -> Result<CheckResult, CheckError> {
    let start = Instant::now();

    let (host, port) = match parse_host_port(target) {
        Some(parts) => parts,
        None => {
            return Ok(tcp_result(Status::Down, start, None, 0));
        }
    };

    let timeout = Duration::from_millis(cfg.timeout_ms);
    let connect = TcpStream::connect((host.as_str(), port));

    let status = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(_stream)) => Status::Up,
        Ok(Err(_)) | Err(_) => Status::Down,
    };

    Ok(tcp_result(status, start, Some(host), port))
}

/// Split a `host:port` target, accepting bracketed IPv6 literals.
pub fn parse_host_port(target: &str) -> Option<(String, u16)> {
    let target = target.trim();

    let (host, port_text) = if let Some(rest) = target.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port_text = rest[end + 1..].strip_prefix(':')?;
        (host, port_text)
    } else {
        let idx = target.rfind(':')?;
        (&target[..idx], &target[idx + 1..])
    };

    if host.is_empty() {
        return None;
    }
    let port: u16 = port_text.parse().ok()?;
    if port == 0 {
        return None;
    }

    Some((host.to_string(), port))
}

fn tcp_result(status: Status, start: Instant, host: Option<String>, port: u16) -> CheckResult {
    CheckResult {
        status,
        response_time_ms: Some(start.elapsed().as_millis() as i64),
        status_code: None,
        details: Some(serde_json::json!({
            "type": "tcp",
            "host": host,
            "port": if port == 0 { None } else { Some(port) },
            "open": status == Status::Up,
        })),
        checked_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("db.example.com:5432"),
            Some(("db.example.com".to_string(), 5432))
        );
        assert_eq!(parse_host_port("[::1]:6379"), Some(("::1".to_string(), 6379)));
        assert_eq!(parse_host_port("no-port"), None);
        assert_eq!(parse_host_port(":80"), None);
        assert_eq!(parse_host_port("host:0"), None);
        assert_eq!(parse_host_port("host:99999"), None);
        assert_eq!(parse_host_port("host:abc"), None);
    }

    #[tokio::test]
    async fn test_open_port_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let result = check_tcp(&addr.to_string(), &MonitoringConfig::default())
            .await
            .unwrap();
        assert_eq!(result.status, Status::Up);
        assert_eq!(result.details.unwrap()["open"], true);
    }

    #[tokio::test]
    async fn test_closed_port_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = check_tcp(&addr.to_string(), &MonitoringConfig::default())
            .await
            .unwrap();
        assert_eq!(result.status, Status::Down);
    }

    #[tokio::test]
    async fn test_malformed_target_is_down() {
        let result = check_tcp("not-a-target", &MonitoringConfig::default())
            .await
            .unwrap();
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.details.unwrap()["open"], false);
    }
}

//! HTTP check implementation.

use chrono::Utc;
use std::time::{Duration, Instant};

use super::CheckError;
use crate::config::MonitoringConfig;
use crate::db::{CheckResult, Status};

/// Issue a GET against the target URL.
///
/// UP iff the final response status is below 400. Redirects are followed up
/// to the configured cap, and the body is read no further than the
/// configured size limit.
pub async fn check_http(target: &str, cfg: &MonitoringConfig) -> Result<CheckResult, CheckError> {
    let timeout = Duration::from_millis(cfg.timeout_ms);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(cfg.max_redirects))
        .build()
        .map_err(|e| CheckError::Network(e.to_string()))?;

    let start = Instant::now();

    let mut response = client.get(target).send().await.map_err(|e| {
        if e.is_timeout() {
            CheckError::Timeout(timeout)
        } else {
            CheckError::Network(e.to_string())
        }
    })?;

    let status_code = response.status();
    let status_text = status_code.canonical_reason().map(|s| s.to_string());
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    // Drain the body up to the size cap so response time covers the
    // transfer, then stop reading.
    let mut read: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(|e| {
        if e.is_timeout() {
            CheckError::Timeout(timeout)
        } else {
            CheckError::Network(e.to_string())
        }
    })? {
        read += chunk.len() as u64;
        if read >= cfg.max_content_length_bytes {
            break;
        }
    }

    let response_time_ms = start.elapsed().as_millis() as i64;
    let status = if status_code.as_u16() < 400 {
        Status::Up
    } else {
        Status::Down
    };

    Ok(CheckResult {
        status,
        response_time_ms: Some(response_time_ms),
        status_code: Some(status_code.as_u16()),
        details: Some(serde_json::json!({
            "type": "http",
            "statusText": status_text,
            "contentType": content_type,
        })),
        checked_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_2xx_is_up_with_details() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok",
        )
        .await;
        let result = check_http(&url, &MonitoringConfig::default()).await.unwrap();
        assert_eq!(result.status, Status::Up);
        assert_eq!(result.status_code, Some(200));
        let details = result.details.unwrap();
        assert_eq!(details["type"], "http");
        assert_eq!(details["contentType"], "text/plain");
    }

    #[tokio::test]
    async fn test_5xx_is_down_not_an_error() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let result = check_http(&url, &MonitoringConfig::default()).await.unwrap();
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.status_code, Some(503));
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        // Bind-then-drop to get a port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = check_http(&format!("http://{}", addr), &MonitoringConfig::default()).await;
        assert!(matches!(result, Err(CheckError::Network(_))));
    }
}

//! State-change notifications.
//!
//! The engine's contract with a notifier is fire-and-forget: the call is
//! spawned off the tick loop, and any delivery failure is the notifier's
//! own concern (logged, never retried, never raised back into the engine).

use std::future::Future;
use std::time::Duration;

use crate::db::{MonitorDefinition, Status};

/// Consumer of UP/DOWN transition events.
pub trait Notifier: Send + Sync + 'static {
    fn notify_state_change(
        &self,
        monitor: MonitorDefinition,
        new_status: Status,
        response_time_ms: Option<i64>,
    ) -> impl Future<Output = ()> + Send;
}

/// Posts transition messages to a Discord webhook. A no-op when the webhook
/// URL is unconfigured.
pub struct DiscordNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(webhook_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            webhook_url,
            client,
        }
    }
}

impl Notifier for DiscordNotifier {
    async fn notify_state_change(
        &self,
        monitor: MonitorDefinition,
        new_status: Status,
        response_time_ms: Option<i64>,
    ) {
        tracing::info!(
            "Notifier: {} is {} ({}ms)",
            monitor.slug,
            new_status,
            response_time_ms.unwrap_or(-1)
        );

        if self.webhook_url.is_empty() {
            return;
        }

        let emoji = match new_status {
            Status::Down => "🚨",
            Status::Up => "✅",
        };
        let content = format!(
            "@everyone @here {} {} is {}\nURL: {}",
            emoji, monitor.name, new_status, monitor.target
        );

        let result = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    "Notifier: webhook returned {} for {}",
                    response.status(),
                    monitor.slug
                );
            }
            Err(e) => tracing::warn!("Notifier: webhook delivery failed for {}: {}", monitor.slug, e),
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every notification for assertions.
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub events: Arc<Mutex<Vec<(String, Status)>>>,
    }

    impl Notifier for RecordingNotifier {
        async fn notify_state_change(
            &self,
            monitor: MonitorDefinition,
            new_status: Status,
            _response_time_ms: Option<i64>,
        ) {
            self.events.lock().unwrap().push((monitor.slug, new_status));
        }
    }
}

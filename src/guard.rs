//! Target safety guard: refuses checks whose target resolves to a private,
//! loopback, or link-local address.
//!
//! DNS classifications are cached per hostname with a TTL so the tick loop
//! does not pay a resolver round trip on every dispatch. Lookup failures are
//! treated as "not blocked": a flaky resolver should degrade to the check's
//! own failure handling, not silently suppress monitoring.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::db::{MonitorDefinition, MonitorType};

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CachedVerdict {
    blocked: bool,
    resolved_at: Instant,
}

/// Per-hostname private-address classifier with a TTL cache.
pub struct SafetyGuard {
    cache: Mutex<HashMap<String, CachedVerdict>>,
    ttl: Duration,
}

impl Default for SafetyGuard {
    fn default() -> Self {
        Self::new(CACHE_TTL)
    }
}

impl SafetyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Decide whether a monitor's target must not be probed.
    ///
    /// An unparsable target is blocked outright; otherwise the extracted
    /// hostname is resolved and blocked if ANY address is private.
    pub async fn is_blocked(&self, monitor: &MonitorDefinition) -> bool {
        let host = match extract_host(monitor.monitor_type, &monitor.target) {
            Some(h) => h,
            None => {
                tracing::warn!(
                    "SafetyGuard: unparsable target for {}: {:?}",
                    monitor.slug,
                    monitor.target
                );
                return true;
            }
        };

        // IP literals need no lookup and no cache.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return is_private_ip(ip);
        }

        if let Some(blocked) = self.cached_verdict(&host) {
            return blocked;
        }

        let blocked = match tokio::net::lookup_host(format!("{}:0", host)).await {
            Ok(addrs) => addrs.into_iter().any(|sa| is_private_ip(sa.ip())),
            Err(e) => {
                tracing::debug!("SafetyGuard: lookup failed for {}: {}", host, e);
                false
            }
        };

        self.cache.lock().unwrap().insert(
            host,
            CachedVerdict {
                blocked,
                resolved_at: Instant::now(),
            },
        );

        blocked
    }

    fn cached_verdict(&self, host: &str) -> Option<bool> {
        let cache = self.cache.lock().unwrap();
        cache
            .get(host)
            .filter(|entry| entry.resolved_at.elapsed() < self.ttl)
            .map(|entry| entry.blocked)
    }
}

/// Extract the hostname to classify, per monitor type.
pub fn extract_host(monitor_type: MonitorType, target: &str) -> Option<String> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }

    match monitor_type {
        MonitorType::Http => {
            let url = reqwest::Url::parse(target).ok()?;
            match url.scheme() {
                "http" | "https" => {}
                _ => return None,
            }
            url.host_str().map(|h| h.to_string())
        }
        MonitorType::Tcp | MonitorType::GameServerQuery => {
            // Share the connect strategy's parser so the guard classifies
            // exactly the host the check would dial.
            match crate::check::parse_host_port(target) {
                Some((host, _port)) => Some(host),
                // A bare hostname with no port is valid for game queries.
                None if !target.contains(':') && !target.contains('[') => {
                    Some(target.to_string())
                }
                None => None,
            }
        }
        MonitorType::Ping => Some(target.to_string()),
    }
}

/// Whether an address falls in a reserved range the engine refuses to probe:
/// loopback, link-local, RFC1918, or IPv6 unique-local.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(mapped));
            }
            let seg0 = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (seg0 & 0xfe00) == 0xfc00 // unique-local fc00::/7
                || (seg0 & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}

//! Cached availability monitor for the AI backend.
//!
//! One monitor instance owns the [`AvailabilityState`] for the process;
//! every dependent component receives a handle at construction time.
//! The cached result is served while within its TTL; callers may force a
//! refresh. Probing is fail-closed: any transport error, timeout, or
//! non-success status reads as unavailable, and probe failures never
//! propagate to callers.
//!
//! Concurrent refreshes are harmless. Probes are idempotent reads, so
//! duplicate in-flight probes simply race to update `last_checked`
//! (last writer wins).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::backend::BackendClient;
use crate::config::AiConfig;
use crate::models::AvailabilityState;

/// User-presentable reason used when AI is switched off.
pub const REASON_DISABLED: &str = "AI features are disabled";
/// User-presentable reason used when the backend cannot be reached.
pub const REASON_UNAVAILABLE: &str = "AI service temporarily unavailable";

#[derive(Debug, Clone, Copy)]
struct ProbeCache {
    available: bool,
    /// The backend can also report itself administratively disabled.
    backend_enabled: bool,
    checked: Option<Instant>,
    checked_at: Option<DateTime<Utc>>,
}

pub struct AvailabilityMonitor {
    backend: Arc<BackendClient>,
    /// Administrative switch from configuration; never changes at runtime.
    enabled: bool,
    cache_duration: Duration,
    cache: RwLock<ProbeCache>,
}

impl AvailabilityMonitor {
    pub fn new(backend: Arc<BackendClient>, config: &AiConfig) -> Self {
        Self {
            backend,
            enabled: config.enabled,
            cache_duration: Duration::from_millis(config.cache_duration_ms),
            cache: RwLock::new(ProbeCache {
                available: false,
                backend_enabled: true,
                checked: None,
                checked_at: None,
            }),
        }
    }

    /// Whether AI features may be used right now.
    ///
    /// Short-circuits to `false` without probing when administratively
    /// disabled. Otherwise serves the cached probe result while within
    /// the TTL, re-probing on expiry or when `force_refresh` is set.
    pub async fn is_available(&self, force_refresh: bool) -> bool {
        if !self.enabled {
            return false;
        }

        if !force_refresh {
            let cache = self.cache.read().await;
            if let Some(checked) = cache.checked {
                if checked.elapsed() < self.cache_duration {
                    return cache.available;
                }
            }
        }

        match self.backend.probe_status().await {
            Ok(status) => {
                let mut cache = self.cache.write().await;
                cache.backend_enabled = status.enabled;
                cache.available = status.enabled && status.available;
                cache.checked = Some(Instant::now());
                cache.checked_at = Some(Utc::now());
                cache.available
            }
            Err(e) => {
                tracing::warn!(error = %e, "AI backend probe failed; treating as unavailable");
                let mut cache = self.cache.write().await;
                cache.available = false;
                cache.checked = Some(Instant::now());
                cache.checked_at = Some(Utc::now());
                false
            }
        }
    }

    /// The administrative switch, independent of probe results.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Reason string distinguishing "switched off" from "unreachable".
    pub async fn degradation_reason(&self) -> String {
        if !self.enabled || !self.cache.read().await.backend_enabled {
            REASON_DISABLED.to_string()
        } else {
            REASON_UNAVAILABLE.to_string()
        }
    }

    /// Snapshot of the current state for status reporting.
    pub async fn state(&self) -> AvailabilityState {
        let cache = self.cache.read().await;
        AvailabilityState {
            enabled: self.enabled && cache.backend_enabled,
            available: self.enabled && cache.available,
            last_checked: cache.checked_at,
            cache_duration_ms: self.cache_duration.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(enabled: bool) -> AvailabilityMonitor {
        // Points at a closed port; every probe fails fast.
        let config = AiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            enabled,
            cache_duration_ms: 30_000,
            timeout_secs: 1,
            max_retries: 0,
        };
        let backend = Arc::new(BackendClient::new(&config).unwrap());
        AvailabilityMonitor::new(backend, &config)
    }

    #[tokio::test]
    async fn test_disabled_short_circuits() {
        let m = monitor(false);
        assert!(!m.is_available(false).await);
        assert!(!m.is_available(true).await);
        // No probe ran, so last_checked stays empty.
        assert!(m.state().await.last_checked.is_none());
        assert_eq!(m.degradation_reason().await, REASON_DISABLED);
    }

    #[tokio::test]
    async fn test_failed_probe_is_unavailable() {
        let m = monitor(true);
        assert!(!m.is_available(false).await);
        let state = m.state().await;
        assert!(state.enabled);
        assert!(!state.available);
        assert!(state.last_checked.is_some());
        assert_eq!(m.degradation_reason().await, REASON_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cached_result_served_within_ttl() {
        let m = monitor(true);
        assert!(!m.is_available(false).await);
        let first = m.state().await.last_checked;

        // Within the TTL the cached value is returned without re-probing.
        assert!(!m.is_available(false).await);
        assert_eq!(m.state().await.last_checked, first);

        // Forcing a refresh re-probes and bumps the timestamp.
        assert!(!m.is_available(true).await);
        assert!(m.state().await.last_checked >= first);
    }
}

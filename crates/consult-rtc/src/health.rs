//! Relay liveness monitoring
//!
//! A [`HealthMonitor`] answers "is the relay worth calling right now?" from a
//! cached flag, refreshing it with a short-timeout probe at most once per
//! interval. Monitors are shared process-wide per relay URL through
//! [`HealthMonitor::shared`], so every session in the process sees the same
//! flag and probes are not multiplied by the number of sessions.

use crate::config::HealthOptions;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A single liveness check against the relay
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Returns true if the relay answered successfully
    async fn probe(&self) -> bool;
}

/// Probes `GET {relay_url}/health`
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a probe for a relay base URL
    ///
    /// # Arguments
    ///
    /// * `relay_url` - Relay base URL (e.g., "http://localhost:8080")
    /// * `timeout` - Client-side timeout for the probe request
    pub fn new(relay_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: format!("{}/health", relay_url.trim_end_matches('/')),
            client,
        })
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Health check failed for {}: {}", self.url, e);
                false
            }
        }
    }
}

/// Cached relay responsiveness
pub struct HealthMonitor {
    probe: Arc<dyn LivenessProbe>,
    interval: Duration,
    timeout: Duration,
    responsive: AtomicBool,
    last_probe: tokio::sync::Mutex<Option<Instant>>,
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<HealthMonitor>>>> = OnceLock::new();

impl HealthMonitor {
    /// Create a monitor around any probe
    ///
    /// The relay is assumed responsive until the first probe says otherwise.
    pub fn new(probe: Arc<dyn LivenessProbe>, options: &HealthOptions) -> Self {
        Self {
            probe,
            interval: options.probe_interval(),
            timeout: options.probe_timeout(),
            responsive: AtomicBool::new(true),
            last_probe: tokio::sync::Mutex::new(None),
        }
    }

    /// Process-wide monitor for a relay URL, created on first use
    pub fn shared(relay_url: &str, options: &HealthOptions) -> Result<Arc<Self>> {
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        let mut monitors = registry.lock();

        if let Some(existing) = monitors.get(relay_url) {
            return Ok(existing.clone());
        }

        let probe = HttpProbe::new(relay_url, options.probe_timeout())?;
        let monitor = Arc::new(Self::new(Arc::new(probe), options));
        monitors.insert(relay_url.to_string(), monitor.clone());
        debug!("Health monitor registered for {}", relay_url);
        Ok(monitor)
    }

    /// Check relay responsiveness, probing if the cached value is older than the interval
    ///
    /// Concurrent callers share one in-flight probe; none waits longer than
    /// the probe timeout.
    pub async fn is_responsive(&self) -> bool {
        let mut last_probe = self.last_probe.lock().await;

        let due = match *last_probe {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        };
        if !due {
            return self.responsive.load(Ordering::Acquire);
        }

        let result = match tokio::time::timeout(self.timeout, self.probe.probe()).await {
            Ok(ok) => ok,
            Err(_) => {
                warn!("Health probe timed out after {:?}", self.timeout);
                false
            }
        };

        let previous = self.responsive.swap(result, Ordering::AcqRel);
        if previous != result {
            if result {
                debug!("Relay became responsive");
            } else {
                warn!("Relay became unresponsive");
            }
        }
        *last_probe = Some(Instant::now());
        result
    }

    /// Last cached value without probing
    pub fn last_known(&self) -> bool {
        self.responsive.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingProbe {
        calls: AtomicUsize,
        answer: AtomicBool,
        delay: Duration,
    }

    impl CountingProbe {
        fn new(answer: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answer: AtomicBool::new(answer),
                delay,
            })
        }
    }

    #[async_trait]
    impl LivenessProbe for CountingProbe {
        async fn probe(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.answer.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_at_most_once_per_interval() {
        let probe = CountingProbe::new(true, Duration::ZERO);
        let monitor = HealthMonitor::new(probe.clone(), &HealthOptions::default());

        assert!(monitor.is_responsive().await);
        assert!(monitor.is_responsive().await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(monitor.is_responsive().await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_failure_until_next_interval() {
        let probe = CountingProbe::new(false, Duration::ZERO);
        let monitor = HealthMonitor::new(probe.clone(), &HealthOptions::default());

        assert!(!monitor.is_responsive().await);
        probe.answer.store(true, Ordering::SeqCst);
        assert!(!monitor.is_responsive().await);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(monitor.is_responsive().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_counts_as_unresponsive() {
        let probe = CountingProbe::new(true, Duration::from_secs(60));
        let monitor = HealthMonitor::new(probe, &HealthOptions::default());

        let started = Instant::now();
        assert!(!monitor.is_responsive().await);
        assert!(started.elapsed() <= Duration::from_secs(4));
        assert!(!monitor.last_known());
    }

    #[test]
    fn test_shared_registry_reuses_monitor() {
        let options = HealthOptions::default();
        let a = HealthMonitor::shared("http://127.0.0.1:1", &options).unwrap();
        let b = HealthMonitor::shared("http://127.0.0.1:1", &options).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let probe = HttpProbe::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(!probe.probe().await);
    }
}

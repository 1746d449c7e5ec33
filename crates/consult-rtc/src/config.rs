//! Configuration types for consultation call sessions

use crate::media::MediaConstraints;
use crate::peer::lifecycle::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a [`CallSession`](crate::session::CallSession)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Relay REST base URL (http:// or https://)
    pub relay_url: String,

    /// Persistent signaling channel URL (ws:// or wss://)
    pub channel_url: String,

    /// Bearer token presented to the relay on every call and on channel authentication
    pub token: String,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Local capture constraints
    pub media: MediaConstraints,

    /// Signal transport behavior
    pub transport: TransportOptions,

    /// Offer/answer and reconnection behavior
    pub negotiation: NegotiationOptions,

    /// Watchdog thresholds
    pub supervisor: SupervisorOptions,

    /// Relay liveness probing
    pub health: HealthOptions,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Signal transport options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Try the persistent channel before the poll transport (default: true)
    pub primary_enabled: bool,

    /// Time allowed for the persistent channel to connect and authenticate (default: 6000ms)
    pub primary_connect_timeout_ms: u64,

    /// Poll transport fetch interval (default: 2000ms)
    pub poll_interval_ms: u64,

    /// Keepalive envelope interval while joined via the poll transport (default: 10000ms)
    pub keepalive_interval_ms: u64,

    /// Timeout for each relay REST call (default: 5000ms)
    pub request_timeout_ms: u64,

    /// Retry policy for outbound envelopes
    pub send_retry: BackoffPolicy,

    /// Consecutive relay failures before switching to direct mode (default: 3)
    pub direct_mode_threshold: u32,

    /// Time in direct mode before the relay is tried again for real (default: 15000ms)
    pub relay_recovery_ms: u64,

    /// Offer re-issue interval in direct mode (default: 5000ms)
    pub direct_offer_interval_ms: u64,

    /// Direct mode gives up and reports an error after this long (default: 30000ms)
    pub direct_give_up_ms: u64,
}

/// Negotiation engine options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationOptions {
    /// Wait after a `disconnected` state before declaring a drop (default: 3000ms)
    pub disconnect_grace_ms: u64,

    /// Automatic reconnection policy (ICE-restart offers)
    pub reconnect: BackoffPolicy,

    /// Time allowed from join to first `PeerConnected` (default: 40000ms)
    pub establishment_timeout_ms: u64,

    /// When joining a room the peer already occupies, how long to wait for
    /// their offer before offering ourselves (default: 5000ms)
    pub initial_offer_wait_ms: u64,

    /// Remote candidates buffered before a remote description exists (default: 64)
    pub pending_candidate_cap: usize,
}

/// Resilience supervisor options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorOptions {
    /// Relay presence check interval (default: 2000ms)
    pub presence_check_interval_ms: u64,

    /// Consecutive mismatching checks before a refresh (default: 3)
    pub mismatch_threshold: u32,

    /// Negotiation errors that trigger a refresh (default: 3)
    pub error_refresh_threshold: u32,

    /// Negotiation errors that end recovery for good (default: 5)
    pub error_ceiling: u32,

    /// Pause between tearing down and rebuilding the peer link (default: 2000ms)
    pub refresh_cooldown_ms: u64,
}

/// Health monitor options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthOptions {
    /// Minimum time between two liveness probes (default: 10000ms)
    pub probe_interval_ms: u64,

    /// Probe timeout (default: 3000ms)
    pub probe_timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:8080".to_string(),
            channel_url: "ws://localhost:8080/ws".to_string(),
            token: String::new(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            media: MediaConstraints::default(),
            transport: TransportOptions::default(),
            negotiation: NegotiationOptions::default(),
            supervisor: SupervisorOptions::default(),
            health: HealthOptions::default(),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            primary_enabled: true,
            primary_connect_timeout_ms: 6000,
            poll_interval_ms: 2000,
            keepalive_interval_ms: 10000,
            request_timeout_ms: 5000,
            send_retry: BackoffPolicy::default(),
            direct_mode_threshold: 3,
            relay_recovery_ms: 15000,
            direct_offer_interval_ms: 5000,
            direct_give_up_ms: 30000,
        }
    }
}

impl Default for NegotiationOptions {
    fn default() -> Self {
        Self {
            disconnect_grace_ms: 3000,
            reconnect: BackoffPolicy::default(),
            establishment_timeout_ms: 40000,
            initial_offer_wait_ms: 5000,
            pending_candidate_cap: 64,
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            presence_check_interval_ms: 2000,
            mismatch_threshold: 3,
            error_refresh_threshold: 3,
            error_ceiling: 5,
            refresh_cooldown_ms: 2000,
        }
    }
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            probe_interval_ms: 10000,
            probe_timeout_ms: 3000,
        }
    }
}

impl TransportOptions {
    pub fn primary_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn relay_recovery(&self) -> Duration {
        Duration::from_millis(self.relay_recovery_ms)
    }

    pub fn direct_offer_interval(&self) -> Duration {
        Duration::from_millis(self.direct_offer_interval_ms)
    }

    pub fn direct_give_up(&self) -> Duration {
        Duration::from_millis(self.direct_give_up_ms)
    }
}

impl NegotiationOptions {
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn establishment_timeout(&self) -> Duration {
        Duration::from_millis(self.establishment_timeout_ms)
    }

    pub fn initial_offer_wait(&self) -> Duration {
        Duration::from_millis(self.initial_offer_wait_ms)
    }
}

impl SupervisorOptions {
    pub fn presence_check_interval(&self) -> Duration {
        Duration::from_millis(self.presence_check_interval_ms)
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_millis(self.refresh_cooldown_ms)
    }
}

impl HealthOptions {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Derive a persistent channel URL (`ws`/`wss` + `/ws`) from a relay base URL
pub fn channel_url_for(relay_url: &str) -> String {
    let trimmed = relay_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}/ws", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}/ws", rest)
    } else {
        format!("{}/ws", trimmed)
    }
}

impl CallConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no STUN or TURN server is configured
    /// - `relay_url` is not an http(s) URL or `channel_url` is not a ws(s) URL
    /// - any interval or timeout is zero
    /// - `error_refresh_threshold` is not below `error_ceiling`
    /// - a backoff policy is malformed
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN or TURN server is required".to_string(),
            ));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        match url::Url::parse(&self.relay_url) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "relay_url must be an http:// or https:// URL, got {}",
                    self.relay_url
                )))
            }
        }

        if !self.channel_url.starts_with("ws://") && !self.channel_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "channel_url must start with ws:// or wss://, got {}",
                self.channel_url
            )));
        }

        let intervals = [
            ("primary_connect_timeout_ms", self.transport.primary_connect_timeout_ms),
            ("poll_interval_ms", self.transport.poll_interval_ms),
            ("keepalive_interval_ms", self.transport.keepalive_interval_ms),
            ("request_timeout_ms", self.transport.request_timeout_ms),
            ("direct_offer_interval_ms", self.transport.direct_offer_interval_ms),
            ("direct_give_up_ms", self.transport.direct_give_up_ms),
            ("disconnect_grace_ms", self.negotiation.disconnect_grace_ms),
            ("establishment_timeout_ms", self.negotiation.establishment_timeout_ms),
            ("initial_offer_wait_ms", self.negotiation.initial_offer_wait_ms),
            ("presence_check_interval_ms", self.supervisor.presence_check_interval_ms),
            ("probe_interval_ms", self.health.probe_interval_ms),
            ("probe_timeout_ms", self.health.probe_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.transport.direct_mode_threshold == 0 {
            return Err(Error::InvalidConfig(
                "direct_mode_threshold must be at least 1".to_string(),
            ));
        }

        if self.supervisor.mismatch_threshold == 0 {
            return Err(Error::InvalidConfig(
                "mismatch_threshold must be at least 1".to_string(),
            ));
        }

        if self.supervisor.error_refresh_threshold >= self.supervisor.error_ceiling {
            return Err(Error::InvalidConfig(format!(
                "error_refresh_threshold ({}) must be below error_ceiling ({})",
                self.supervisor.error_refresh_threshold, self.supervisor.error_ceiling
            )));
        }

        self.transport.send_retry.validate("transport.send_retry")?;
        self.negotiation.reconnect.validate("negotiation.reconnect")?;
        self.media.validate()?;

        Ok(())
    }

    /// Parse a configuration from TOML; missing fields take their defaults
    pub fn from_toml_str(s: &str) -> crate::Result<Self> {
        let config: CallConfig = toml::from_str(s)
            .map_err(|e| crate::Error::InvalidConfig(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Create a configuration preset for good networks
    ///
    /// Shorter grace period and establishment timeout so that real failures
    /// are acted on quickly.
    ///
    /// # Example
    ///
    /// ```
    /// use consult_rtc::config::CallConfig;
    ///
    /// let config = CallConfig::low_latency("https://relay.example.com");
    /// assert_eq!(config.channel_url, "wss://relay.example.com/ws");
    /// assert_eq!(config.negotiation.disconnect_grace_ms, 2000);
    /// ```
    pub fn low_latency(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            channel_url: channel_url_for(relay_url),
            transport: TransportOptions {
                primary_connect_timeout_ms: 5000,
                poll_interval_ms: 1500,
                ..Default::default()
            },
            negotiation: NegotiationOptions {
                disconnect_grace_ms: 2000,
                establishment_timeout_ms: 30000,
                initial_offer_wait_ms: 3000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration preset for cellular or otherwise flaky networks
    ///
    /// Longer grace period, more reconnection attempts with a slower backoff,
    /// and a more patient establishment timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use consult_rtc::config::CallConfig;
    ///
    /// let config = CallConfig::unreliable_network("http://localhost:8080");
    /// assert_eq!(config.negotiation.reconnect.max_attempts, 8);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn unreliable_network(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            channel_url: channel_url_for(relay_url),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            transport: TransportOptions {
                primary_connect_timeout_ms: 8000,
                send_retry: BackoffPolicy {
                    max_attempts: 7,
                    ..Default::default()
                },
                ..Default::default()
            },
            negotiation: NegotiationOptions {
                disconnect_grace_ms: 5000,
                reconnect: BackoffPolicy {
                    max_attempts: 8,
                    initial_ms: 2000,
                    max_ms: 10000,
                    multiplier: 1.5,
                    jitter: 0.15,
                },
                establishment_timeout_ms: 45000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers.extend(turn_servers);
        self
    }
}

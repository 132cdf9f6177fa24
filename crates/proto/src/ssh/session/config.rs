//! Session configuration.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tether_proto::ssh::hostkey::HostKeyInfo;
//! use tether_proto::ssh::session::SessionConfig;
//!
//! let config = SessionConfig::builder()
//!     .host_key_verifier(|info: &HostKeyInfo| info.algorithm == "ssh-ed25519")
//!     .keepalive(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.timeouts.connect, Some(Duration::from_secs(30)));
//! ```

use std::sync::Arc;
use std::time::Duration;

use tether_platform::{TetherError, TetherResult};

use crate::ssh::channel::{ChannelConfig, X11Handler};
use crate::ssh::hostkey::HostKeyVerifier;
pub use crate::ssh::kex::AlgorithmPreferences;
use crate::ssh::transport::RekeyLimits;
use crate::ssh::version::Version;

/// Default deadlines per operation kind. `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Identification, key exchange and host key check
    pub connect: Option<Duration>,
    /// Login and method listing
    pub login: Option<Duration>,
    /// Channel open
    pub open_channel: Option<Duration>,
    /// Channel requests, EOF, close and re-key
    pub request: Option<Duration>,
    /// Channel sends
    pub send: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        let thirty = Some(Duration::from_secs(30));
        Self {
            connect: thirty,
            login: thirty,
            open_channel: thirty,
            request: thirty,
            send: None,
        }
    }
}

/// When to re-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyPolicy {
    /// Volume thresholds per direction
    pub limits: RekeyLimits,
    /// Time since the last exchange
    pub interval: Option<Duration>,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            limits: RekeyLimits::default(),
            interval: Some(Duration::from_secs(3600)),
        }
    }
}

/// Complete session configuration.
#[derive(Clone)]
pub struct SessionConfig {
    /// Our identification line
    pub version: Version,
    /// Algorithm preference lists
    pub algorithms: AlgorithmPreferences,
    /// Server host key trust policy
    pub verifier: Arc<dyn HostKeyVerifier>,
    /// Default operation deadlines
    pub timeouts: Timeouts,
    /// Re-key thresholds
    pub rekey: RekeyPolicy,
    /// Window and packet sizes for opened channels
    pub channel: ChannelConfig,
    /// Keep-alive period
    pub keepalive: Option<Duration>,
    /// Receiver for server-opened X11 channels; `None` refuses them
    pub x11: Option<Arc<dyn X11Handler>>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("version", &self.version.identification())
            .field("algorithms", &self.algorithms)
            .field("timeouts", &self.timeouts)
            .field("rekey", &self.rekey)
            .field("channel", &self.channel)
            .field("keepalive", &self.keepalive)
            .field("x11_forwarding", &self.x11.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    /// Starts a builder with the defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns `Config` for empty or unknown algorithm lists, a window
    /// smaller than the maximum packet, or a zero threshold.
    pub fn validate(&self) -> TetherResult<()> {
        self.algorithms.validate()?;

        let channel = &self.channel;
        if channel.max_packet == 0 {
            return Err(TetherError::config("maximum packet size must be non-zero"));
        }
        if channel.initial_window < channel.max_packet {
            return Err(TetherError::config(format!(
                "initial window {} smaller than maximum packet {}",
                channel.initial_window, channel.max_packet
            )));
        }
        if channel.low_water == 0 || channel.low_water > channel.initial_window {
            return Err(TetherError::config(format!(
                "low-water mark {} outside 1..={}",
                channel.low_water, channel.initial_window
            )));
        }
        if self.rekey.limits.bytes == 0 || self.rekey.limits.packets == 0 {
            return Err(TetherError::config("re-key thresholds must be non-zero"));
        }

        let zero = Some(Duration::ZERO);
        if self.rekey.interval == zero || self.keepalive == zero {
            return Err(TetherError::config("intervals must be non-zero"));
        }
        let t = &self.timeouts;
        if [t.connect, t.login, t.open_channel, t.request, t.send].contains(&zero) {
            return Err(TetherError::config("timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`].
#[derive(Default)]
pub struct SessionConfigBuilder {
    software: Option<String>,
    algorithms: Option<AlgorithmPreferences>,
    verifier: Option<Arc<dyn HostKeyVerifier>>,
    timeouts: Timeouts,
    rekey: RekeyPolicy,
    channel: Option<ChannelConfig>,
    keepalive: Option<Duration>,
    x11: Option<Arc<dyn X11Handler>>,
}

impl SessionConfigBuilder {
    /// Software part of our identification line.
    pub fn software(mut self, software: impl Into<String>) -> Self {
        self.software = Some(software.into());
        self
    }

    /// Algorithm preference lists.
    pub fn algorithms(mut self, algorithms: AlgorithmPreferences) -> Self {
        self.algorithms = Some(algorithms);
        self
    }

    /// Host key trust policy. Required.
    pub fn host_key_verifier(mut self, verifier: impl HostKeyVerifier + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// Host key trust policy, shared.
    pub fn shared_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Default deadlines.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Connect deadline.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeouts.connect = timeout;
        self
    }

    /// Re-key policy.
    pub fn rekey(mut self, rekey: RekeyPolicy) -> Self {
        self.rekey = rekey;
        self
    }

    /// Initial window and maximum packet for opened channels. The
    /// low-water mark is half the window.
    pub fn channel_window(mut self, initial_window: u32, max_packet: u32) -> Self {
        self.channel = Some(ChannelConfig {
            initial_window,
            max_packet,
            low_water: initial_window / 2,
        });
        self
    }

    /// Full channel parameters.
    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Keep-alive period.
    pub fn keepalive(mut self, period: Duration) -> Self {
        self.keepalive = Some(period);
        self
    }

    /// Accepts X11 channels the server opens and hands them to `handler`.
    /// Pair with an "x11-req" on a session channel.
    pub fn x11_handler(mut self, handler: impl X11Handler + 'static) -> Self {
        self.x11 = Some(Arc::new(handler));
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Config` when no verifier was given or validation fails.
    pub fn build(self) -> TetherResult<SessionConfig> {
        let verifier = self
            .verifier
            .ok_or_else(|| TetherError::config("a host key verifier is required"))?;
        let version = match self.software {
            Some(software) => {
                if software.is_empty() || software.chars().any(|c| c.is_whitespace() || c == '-') {
                    return Err(TetherError::config(format!(
                        "invalid software version '{}'",
                        software
                    )));
                }
                Version::new(&software, None)
            }
            None => Version::default_tether(),
        };

        let config = SessionConfig {
            version,
            algorithms: self.algorithms.unwrap_or_default(),
            verifier,
            timeouts: self.timeouts,
            rekey: self.rekey,
            channel: self.channel.unwrap_or_default(),
            keepalive: self.keepalive,
            x11: self.x11,
        };
        config.validate()?;
        Ok(config)
    }
}

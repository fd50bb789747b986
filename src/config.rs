//! Bridge configuration
//!
//! Defaults cover the common case (UDP forwarding, bounded waits). A JSON
//! file can override any field and a handful of environment variables
//! override the file.

use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// How media reaches the local consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// The consumer reads the SDP over TCP and receives RTP/RTCP on plain UDP
    /// ports. Packet reordering is left to the consumer's jitter buffer.
    #[default]
    Udp,
    /// The consumer speaks RTSP and receives every packet interleaved on the
    /// same TCP connection, strictly ordered.
    TcpInterleaved,
}

impl TransportMode {
    pub fn url_scheme(&self) -> &'static str {
        match self {
            TransportMode::Udp => "tcp",
            TransportMode::TcpInterleaved => "rtsp",
        }
    }
}

impl FromStr for TransportMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportMode::Udp),
            "tcp" | "tcp_interleaved" | "rtsp" => Ok(TransportMode::TcpInterleaved),
            other => Err(BridgeError::Config(format!("unknown transport mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mode: TransportMode,
    /// Lower bound (inclusive) for the advertised media ports.
    pub port_range_start: u16,
    /// Upper bound (exclusive) for the advertised media ports.
    pub port_range_end: u16,
    /// How long to wait for the local consumer to connect. 0 waits forever.
    pub client_connect_timeout_ms: u64,
    /// How long negotiation may take once the consumer is connected. 0 waits forever.
    pub negotiation_timeout_ms: u64,
    /// Interval between PLI requests on the video track. 0 disables them.
    pub keyframe_interval_ms: u64,
    /// Listen address of the HTTP signaling front.
    pub http_bind: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            mode: TransportMode::Udp,
            port_range_start: 30000,
            port_range_end: 40000,
            client_connect_timeout_ms: 30_000,
            negotiation_timeout_ms: 30_000,
            keyframe_interval_ms: 0,
            http_bind: "0.0.0.0:3000".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<BridgeConfig> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        config.validate()
    }

    /// Applies `BRIDGE_*` overrides from the process environment.
    pub fn with_env(self) -> Result<BridgeConfig> {
        self.with_overrides(std::env::vars())
    }

    /// Applies `BRIDGE_*` overrides from an arbitrary set of variables.
    pub fn with_overrides<I, K, V>(mut self, vars: I) -> Result<BridgeConfig>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "BRIDGE_MODE" => self.mode = value.parse()?,
                "BRIDGE_HTTP_BIND" => self.http_bind = value.to_string(),
                "BRIDGE_KEYFRAME_INTERVAL" => {
                    self.keyframe_interval_ms = parse_millis("BRIDGE_KEYFRAME_INTERVAL", value)?
                }
                "BRIDGE_CLIENT_CONNECT_TIMEOUT" => {
                    self.client_connect_timeout_ms =
                        parse_millis("BRIDGE_CLIENT_CONNECT_TIMEOUT", value)?
                }
                "BRIDGE_NEGOTIATION_TIMEOUT" => {
                    self.negotiation_timeout_ms =
                        parse_millis("BRIDGE_NEGOTIATION_TIMEOUT", value)?
                }
                _ => {}
            }
        }
        self.validate()
    }

    fn validate(self) -> Result<BridgeConfig> {
        self.check_port_range()?;
        Ok(self)
    }

    pub(crate) fn check_port_range(&self) -> Result<()> {
        // Two even ports plus their RTCP neighbours must fit with room to pick.
        if self.port_range_end <= self.port_range_start
            || self.port_range_end - self.port_range_start < 8
        {
            return Err(BridgeError::Config(format!(
                "port range {}..{} is too small",
                self.port_range_start, self.port_range_end
            )));
        }
        Ok(())
    }

    pub fn client_connect_timeout(&self) -> Option<Duration> {
        non_zero(self.client_connect_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        non_zero(self.negotiation_timeout_ms)
    }

    pub fn keyframe_interval(&self) -> Option<Duration> {
        non_zero(self.keyframe_interval_ms)
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_millis(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| BridgeError::Config(format!("{name} must be milliseconds, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_udp_and_bounded_waits() {
        let config = BridgeConfig::default();
        assert_eq!(config.mode, TransportMode::Udp);
        assert_eq!(config.client_connect_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.keyframe_interval(), None);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"mode":"tcp_interleaved","keyframe_interval_ms":4000}"#)
                .unwrap();
        assert_eq!(config.mode, TransportMode::TcpInterleaved);
        assert_eq!(config.keyframe_interval(), Some(Duration::from_secs(4)));
        assert_eq!(config.port_range_start, 30000);
    }

    #[test]
    fn env_overrides_apply() {
        let config = BridgeConfig::default()
            .with_overrides([
                ("BRIDGE_MODE", "rtsp"),
                ("BRIDGE_NEGOTIATION_TIMEOUT", "0"),
                ("UNRELATED", "x"),
            ])
            .unwrap();
        assert_eq!(config.mode, TransportMode::TcpInterleaved);
        assert_eq!(config.negotiation_timeout(), None);
    }

    #[test]
    fn bad_override_is_rejected() {
        let err = BridgeConfig::default()
            .with_overrides([("BRIDGE_MODE", "carrier-pigeon")])
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn tiny_port_range_is_rejected() {
        let config = BridgeConfig {
            port_range_start: 30000,
            port_range_end: 30002,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn url_scheme_follows_mode() {
        assert_eq!(TransportMode::Udp.url_scheme(), "tcp");
        assert_eq!(TransportMode::TcpInterleaved.url_scheme(), "rtsp");
    }
}

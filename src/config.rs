use crate::error::ScanError;
use crate::hosts::DEFAULT_MAX_HOSTS;
use crate::ports::{parse_ports, validate_ports};
use crate::scanner::ScanOptions;
use crate::types::ProtocolMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const MIN_TIMEOUT_SECS: f64 = 0.1;
const MAX_TIMEOUT_SECS: f64 = 10.0;
const MAX_RETRY_COUNT: u32 = 5;

/// Scanner settings as stored by the settings front-end (JSON).
///
/// Missing keys take their defaults; unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Per-probe timeout in seconds.
    pub timeout: f64,
    /// Extra DNS attempts after the first one fails.
    pub retry_count: u32,
    pub max_concurrent_threads: usize,
    /// Shuffle the port order once per session.
    pub randomize_ports: bool,
    /// Sleep a random delay before each probe.
    pub variable_delay_scan: bool,
    /// Upper bound of the random pre-probe delay.
    pub max_delay_ms: u64,
    pub max_cidr_hosts: usize,
    pub fragmented_packets: bool,
    pub banner_grabbing: bool,
    pub show_open_only: bool,
    pub protocol: ProtocolMode,
    pub default_host: String,
    pub default_ports: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout: 0.3,
            retry_count: 2,
            max_concurrent_threads: 100,
            randomize_ports: false,
            variable_delay_scan: false,
            max_delay_ms: 250,
            max_cidr_hosts: DEFAULT_MAX_HOSTS,
            fragmented_packets: false,
            banner_grabbing: false,
            show_open_only: false,
            protocol: ProtocolMode::Tcp,
            default_host: String::new(),
            default_ports: String::new(),
        }
    }
}

impl ScanConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ScanError> {
        let cfg: ScanConfig =
            serde_json::from_str(s).map_err(|e| ScanError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ScanError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if !self.timeout.is_finite()
            || !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&self.timeout)
        {
            return Err(ScanError::Config(format!(
                "timeout must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} seconds, got {}",
                self.timeout
            )));
        }
        if self.retry_count > MAX_RETRY_COUNT {
            return Err(ScanError::Config(format!(
                "retry_count must be at most {MAX_RETRY_COUNT}, got {}",
                self.retry_count
            )));
        }
        if self.max_concurrent_threads == 0 {
            return Err(ScanError::Config("max_concurrent_threads must be at least 1".into()));
        }
        if self.max_cidr_hosts == 0 {
            return Err(ScanError::Config("max_cidr_hosts must be at least 1".into()));
        }
        validate_ports(&parse_ports(&self.default_ports))?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Per-session options derived from these settings.
    pub fn options(&self) -> ScanOptions {
        ScanOptions {
            protocol_mode: self.protocol,
            timeout: self.timeout(),
            max_threads: self.max_concurrent_threads,
            randomize_order: self.randomize_ports,
            jitter: self
                .variable_delay_scan
                .then(|| Duration::from_millis(self.max_delay_ms)),
            fragmented: self.fragmented_packets,
            banner_grabbing: self.banner_grabbing,
            show_open_only: self.show_open_only,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ScanConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.timeout(), Duration::from_millis(300));
        assert_eq!(cfg.max_cidr_hosts, 254);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"timeout": 1.5, "banner_grabbing": true, "extra": 1}"#;
        let cfg = ScanConfig::from_json_str(json).unwrap();
        assert_eq!(cfg.timeout(), Duration::from_millis(1500));
        assert!(cfg.banner_grabbing);
        assert_eq!(cfg.retry_count, 2);
    }

    #[test]
    fn out_of_range_values_rejected() {
        assert!(ScanConfig::from_json_str(r#"{"timeout": 0}"#).is_err());
        assert!(ScanConfig::from_json_str(r#"{"retry_count": 9}"#).is_err());
        assert!(ScanConfig::from_json_str(r#"{"max_concurrent_threads": 0}"#).is_err());
        assert!(matches!(
            ScanConfig::from_json_str(r#"{"default_ports": "22,70000"}"#),
            Err(ScanError::InvalidPorts { .. })
        ));
    }

    #[test]
    fn options_follow_flags() {
        let cfg = ScanConfig {
            variable_delay_scan: true,
            max_delay_ms: 40,
            protocol: ProtocolMode::Both,
            ..ScanConfig::default()
        };
        let opts = cfg.options();
        assert_eq!(opts.jitter, Some(Duration::from_millis(40)));
        assert_eq!(opts.protocol_mode, ProtocolMode::Both);
        assert!(ScanConfig::default().options().jitter.is_none());
    }
}

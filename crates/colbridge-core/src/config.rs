//! Bridge configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Capacity (in batches) of the queue between the engine and a pull consumer.
    pub sink_buffer_size: usize,

    /// Name given to the host thread that runs a pull consumer.
    pub consumer_thread_name: String,

    /// Allow deriving a scan schema by opening (never pulling) one probe reader
    /// from the source factory. When false, scans must carry an explicit schema.
    pub probe_schema: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sink_buffer_size: 16,
            consumer_thread_name: "colbridge-sink-consumer".to_string(),
            probe_schema: true,
        }
    }
}

impl BridgeConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `COLBRIDGE_SINK_BUFFER_SIZE`: pull-sink queue capacity in batches
    /// - `COLBRIDGE_CONSUMER_THREAD_NAME`: consumer thread name
    /// - `COLBRIDGE_PROBE_SCHEMA`: `true`/`false`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("COLBRIDGE_SINK_BUFFER_SIZE") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.sink_buffer_size = v;
            }
        }

        if let Ok(s) = std::env::var("COLBRIDGE_CONSUMER_THREAD_NAME") {
            if !s.trim().is_empty() {
                cfg.consumer_thread_name = s;
            }
        }

        if let Ok(s) = std::env::var("COLBRIDGE_PROBE_SCHEMA") {
            if let Some(v) = parse_bool(&s) {
                cfg.probe_schema = v;
            }
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.sink_buffer_size == 0 {
            return Err(Error::Config(
                "sink_buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.sink_buffer_size, 16);
        assert!(cfg.probe_schema);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let cfg = BridgeConfig {
            sink_buffer_size: 0,
            ..BridgeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" On "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = BridgeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}

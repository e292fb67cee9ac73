//! Bus construction from configuration

use std::sync::Arc;

use crate::error::{BusError, Result};
use crate::memory::{InProcessBus, InProcessBusConfig};
use crate::relay::{RelayBus, RelayBusConfig};
use crate::EventBus;

/// Build the configured bus implementation.
///
/// `memory` needs no brokers; `relay` requires at least one (validated at
/// config load, re-checked here for callers constructing configs by hand).
pub fn build_bus(config: &config::BusConfig) -> Result<Arc<dyn EventBus>> {
    match config.bus_type.as_str() {
        "memory" => Ok(Arc::new(InProcessBus::new(InProcessBusConfig::from_config(
            config,
        )))),
        "relay" => {
            if config.brokers.is_empty() {
                return Err(BusError::ConnectionFailed(
                    "relay bus requires at least one broker endpoint".to_string(),
                ));
            }
            Ok(Arc::new(RelayBus::new(RelayBusConfig::from_config(config))))
        }
        other => Err(BusError::UnsupportedBusType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_bus_builds() {
        let config = config::BusConfig::default();
        assert!(build_bus(&config).is_ok());
    }

    #[test]
    fn relay_without_brokers_is_rejected() {
        let config = config::BusConfig {
            bus_type: "relay".to_string(),
            ..config::BusConfig::default()
        };
        assert!(matches!(
            build_bus(&config).unwrap_err(),
            BusError::ConnectionFailed(_)
        ));
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let config = config::BusConfig {
            bus_type: "kafka".to_string(),
            ..config::BusConfig::default()
        };
        assert!(matches!(
            build_bus(&config).unwrap_err(),
            BusError::UnsupportedBusType(t) if t == "kafka"
        ));
    }
}

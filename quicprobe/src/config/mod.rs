//! Probe configuration module.
//!
//! Settings for the endpoint under test, the transport parameters it
//! advertises, and logging. Scripts describe what the peer does; this
//! describes who it is talking to.
//!
//! # Example
//!
//! ```toml
//! [endpoint]
//! local_cid_len = 8
//! max_datagram_size = 1200
//!
//! [transport]
//! initial_max_data = 1048576
//! initial_max_streams_bidi = 100
//!
//! [logging]
//! level = "debug"
//! json_format = true
//! ```

pub mod endpoint;
pub mod loader;
pub mod logging;
pub mod validation;

#[cfg(test)]
mod tests;

pub use endpoint::{EndpointSettings, TransportSettings};
pub use loader::{load_config, CliArgs};
pub use logging::{LogLevel, LoggingConfig};
pub use validation::ConfigValidator;

use quicprobe_quic::EndpointConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration of a probe run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Endpoint under test
    pub endpoint: EndpointSettings,

    /// Transport parameters the endpoint advertises
    pub transport: TransportSettings,

    pub logging: LoggingConfig,
}

impl ProbeConfig {
    /// Validate every section, then the sections against each other.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for result in [
            self.endpoint.validate(),
            self.transport.validate(),
            self.logging.validate(),
        ] {
            if let Err(e) = result {
                errors.extend(e);
            }
        }
        if let Err(e) = validation::validate_cross_section(self) {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Core endpoint configuration for a server under test.
    pub fn endpoint_config(&self) -> EndpointConfig {
        let mut config = EndpointConfig::server();
        self.endpoint.apply(&mut config);
        config.transport = self.transport.to_parameters();
        config
    }
}

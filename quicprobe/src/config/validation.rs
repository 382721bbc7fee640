//! Configuration validation utilities.
//!
//! Each section validates itself through [`ConfigValidator`]; the checks
//! here look at sections together.

use super::ProbeConfig;

/// Configuration validator trait.
pub trait ConfigValidator {
    /// Validate the configuration.
    ///
    /// Returns `Ok(())` if valid, or a list of error messages if invalid.
    fn validate(&self) -> Result<(), Vec<String>>;
}

/// Checks that span the endpoint and transport sections.
pub fn validate_cross_section(config: &ProbeConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let endpoint = &config.endpoint;
    let transport = &config.transport;

    if let Some(limit) = transport.active_connection_id_limit {
        if endpoint.local_cid_len == 0 && limit > 2 {
            tracing::warn!(
                limit,
                "active_connection_id_limit has no effect with zero-length connection IDs"
            );
        }
    }

    // The endpoint must be able to send what it tells the peer it accepts
    if let Some(size) = transport.max_udp_payload_size {
        if (endpoint.max_datagram_size as u64) > size {
            errors.push(format!(
                "endpoint.max_datagram_size ({}) exceeds transport.max_udp_payload_size ({})",
                endpoint.max_datagram_size, size
            ));
        }
    }

    let stream_windows = [
        transport.initial_max_stream_data_bidi_local,
        transport.initial_max_stream_data_bidi_remote,
        transport.initial_max_stream_data_uni,
    ];
    if let Some(max_data) = transport.initial_max_data {
        if stream_windows.iter().flatten().any(|w| *w > max_data) {
            tracing::warn!(
                max_data,
                "a stream window exceeds initial_max_data; connection credit will bind first"
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

//! Endpoint and transport parameter settings.

use quicprobe_quic::connection::default_transport_parameters;
use quicprobe_quic::transport::TransportParameters;
use quicprobe_quic::EndpointConfig;
use serde::{Deserialize, Serialize};

use super::ConfigValidator;

/// Longest connection ID allowed by RFC 9000
const MAX_CID_LEN: usize = 20;

/// Smallest datagram a QUIC endpoint must support
const MIN_DATAGRAM_SIZE: usize = 1200;

/// Largest value a QUIC varint can carry
const MAX_VARINT: u64 = (1 << 62) - 1;

/// How the endpoint under test behaves on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Length of the connection IDs the endpoint issues.
    ///
    /// **Default:** `8`
    pub local_cid_len: usize,

    /// Largest datagram the endpoint builds.
    ///
    /// **Default:** `1200`
    pub max_datagram_size: usize,

    /// Out-of-order CRYPTO data buffered per encryption level.
    ///
    /// **Default:** `65536`
    pub crypto_buffer_size: u64,

    /// NEW_CONNECTION_ID frames sent when the handshake completes.
    ///
    /// **Default:** `1`
    pub extra_connection_ids: u64,

    /// Seed of the endpoint's random source. Runs with the same seed
    /// produce the same connection IDs and hello randoms.
    pub seed: u64,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        let core = EndpointConfig::server();
        Self {
            local_cid_len: core.local_cid_len,
            max_datagram_size: core.max_datagram_size,
            crypto_buffer_size: core.crypto_buffer_size,
            extra_connection_ids: core.extra_connection_ids,
            seed: 1,
        }
    }
}

impl EndpointSettings {
    pub(crate) fn apply(&self, config: &mut EndpointConfig) {
        config.local_cid_len = self.local_cid_len;
        config.max_datagram_size = self.max_datagram_size;
        config.crypto_buffer_size = self.crypto_buffer_size;
        config.extra_connection_ids = self.extra_connection_ids;
    }
}

impl ConfigValidator for EndpointSettings {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.local_cid_len > MAX_CID_LEN {
            errors.push(format!(
                "endpoint.local_cid_len ({}) exceeds {} bytes",
                self.local_cid_len, MAX_CID_LEN
            ));
        }
        if self.max_datagram_size < MIN_DATAGRAM_SIZE {
            errors.push(format!(
                "endpoint.max_datagram_size ({}) below {}",
                self.max_datagram_size, MIN_DATAGRAM_SIZE
            ));
        }
        if self.max_datagram_size > 65527 {
            errors.push("endpoint.max_datagram_size exceeds a UDP payload".to_string());
        }
        if self.crypto_buffer_size == 0 {
            errors.push("endpoint.crypto_buffer_size must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Transport parameters advertised by the endpoint under test.
///
/// Unset values are left out of the encoded parameter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Milliseconds
    pub max_idle_timeout: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub max_udp_payload_size: Option<u64>,
    pub ack_delay_exponent: Option<u64>,
    /// Milliseconds
    pub max_ack_delay: Option<u64>,
    /// Microseconds; advertising it enables ACK_FREQUENCY
    pub min_ack_delay: Option<u64>,
    pub active_connection_id_limit: Option<u64>,
    pub disable_active_migration: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let params = default_transport_parameters();
        Self {
            max_idle_timeout: params.max_idle_timeout,
            initial_max_data: params.initial_max_data,
            initial_max_stream_data_bidi_local: params.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: params.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: params.initial_max_stream_data_uni,
            initial_max_streams_bidi: params.initial_max_streams_bidi,
            initial_max_streams_uni: params.initial_max_streams_uni,
            max_udp_payload_size: params.max_udp_payload_size,
            ack_delay_exponent: params.ack_delay_exponent,
            max_ack_delay: params.max_ack_delay,
            min_ack_delay: params.min_ack_delay,
            active_connection_id_limit: params.active_connection_id_limit,
            disable_active_migration: params.disable_active_migration.is_some(),
        }
    }
}

impl TransportSettings {
    pub fn to_parameters(&self) -> TransportParameters {
        TransportParameters {
            max_idle_timeout: self.max_idle_timeout,
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: self.initial_max_stream_data_uni,
            initial_max_streams_bidi: self.initial_max_streams_bidi,
            initial_max_streams_uni: self.initial_max_streams_uni,
            max_udp_payload_size: self.max_udp_payload_size,
            ack_delay_exponent: self.ack_delay_exponent,
            max_ack_delay: self.max_ack_delay,
            min_ack_delay: self.min_ack_delay,
            active_connection_id_limit: self.active_connection_id_limit,
            disable_active_migration: self.disable_active_migration.then_some(()),
            ..TransportParameters::default()
        }
    }

    fn values(&self) -> [(&'static str, Option<u64>); 12] {
        [
            ("max_idle_timeout", self.max_idle_timeout),
            ("initial_max_data", self.initial_max_data),
            ("initial_max_stream_data_bidi_local", self.initial_max_stream_data_bidi_local),
            ("initial_max_stream_data_bidi_remote", self.initial_max_stream_data_bidi_remote),
            ("initial_max_stream_data_uni", self.initial_max_stream_data_uni),
            ("initial_max_streams_bidi", self.initial_max_streams_bidi),
            ("initial_max_streams_uni", self.initial_max_streams_uni),
            ("max_udp_payload_size", self.max_udp_payload_size),
            ("ack_delay_exponent", self.ack_delay_exponent),
            ("max_ack_delay", self.max_ack_delay),
            ("min_ack_delay", self.min_ack_delay),
            ("active_connection_id_limit", self.active_connection_id_limit),
        ]
    }
}

impl ConfigValidator for TransportSettings {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors: Vec<String> = self
            .values()
            .iter()
            .filter(|(_, value)| value.map_or(false, |v| v > MAX_VARINT))
            .map(|(name, _)| format!("transport.{name} does not fit a varint"))
            .collect();

        // RFC 9000 Section 18.2
        if self.ack_delay_exponent.map_or(false, |e| e > 20) {
            errors.push("transport.ack_delay_exponent must be <= 20".to_string());
        }
        if self.max_ack_delay.map_or(false, |d| d >= 1 << 14) {
            errors.push("transport.max_ack_delay must be < 16384 ms".to_string());
        }
        if self.active_connection_id_limit.map_or(false, |l| l < 2) {
            errors.push("transport.active_connection_id_limit must be >= 2".to_string());
        }
        if self.max_udp_payload_size.map_or(false, |s| s < 1200) {
            errors.push("transport.max_udp_payload_size must be >= 1200".to_string());
        }
        for (name, limit) in [
            ("initial_max_streams_bidi", self.initial_max_streams_bidi),
            ("initial_max_streams_uni", self.initial_max_streams_uni),
        ] {
            if limit.map_or(false, |l| l > 1 << 60) {
                errors.push(format!("transport.{name} must be <= 2^60"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

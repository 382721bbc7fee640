//! Tests for the configuration module.
//!
//! Tests cover:
//! - Default values and their validity
//! - Section validation and cross-section checks
//! - Loading from TOML files and CLI overrides

mod endpoint_settings_tests {
    use crate::config::{ConfigValidator, EndpointSettings};

    #[test]
    fn test_endpoint_defaults_are_valid() {
        let settings = EndpointSettings::default();
        assert_eq!(settings.local_cid_len, 8);
        assert_eq!(settings.max_datagram_size, 1200);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_cid_longer_than_20_bytes() {
        let settings = EndpointSettings {
            local_cid_len: 21,
            ..EndpointSettings::default()
        };
        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("local_cid_len")));
    }

    #[test]
    fn test_datagram_below_minimum() {
        let settings = EndpointSettings {
            max_datagram_size: 1199,
            ..EndpointSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}

mod transport_settings_tests {
    use crate::config::{ConfigValidator, TransportSettings};

    #[test]
    fn test_defaults_match_core_parameters() {
        let params = TransportSettings::default().to_parameters();
        assert_eq!(params, quicprobe_quic::connection::default_transport_parameters());
    }

    #[test]
    fn test_unset_values_are_absent() {
        let settings = TransportSettings {
            min_ack_delay: None,
            ..TransportSettings::default()
        };
        assert!(settings.to_parameters().min_ack_delay.is_none());
    }

    #[test]
    fn test_rfc_bounds() {
        let settings = TransportSettings {
            ack_delay_exponent: Some(21),
            active_connection_id_limit: Some(1),
            max_ack_delay: Some(1 << 14),
            ..TransportSettings::default()
        };
        let errors = settings.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_value_beyond_varint() {
        let settings = TransportSettings {
            initial_max_data: Some(1 << 62),
            ..TransportSettings::default()
        };
        let errors = settings.validate().unwrap_err();
        assert!(errors[0].contains("initial_max_data"));
    }
}

mod probe_config_tests {
    use crate::config::{ProbeConfig, TransportSettings};

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProbeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_datagram_larger_than_advertised_payload() {
        let mut config = ProbeConfig::default();
        config.endpoint.max_datagram_size = 1500;
        config.transport = TransportSettings {
            max_udp_payload_size: Some(1300),
            ..TransportSettings::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("max_udp_payload_size"));
    }

    #[test]
    fn test_endpoint_config_carries_settings() {
        let mut config = ProbeConfig::default();
        config.endpoint.local_cid_len = 4;
        config.transport.initial_max_streams_uni = Some(3);
        let core = config.endpoint_config();
        assert!(core.side.is_server());
        assert_eq!(core.local_cid_len, 4);
        assert_eq!(core.transport.initial_max_streams_uni, Some(3));
    }
}

mod loader_tests {
    use crate::config::loader::{
        apply_cli_overrides, apply_env_overrides, default_config_toml, load_config_file,
    };
    use crate::config::{CliArgs, LogLevel, ProbeConfig};
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.endpoint.seed, ProbeConfig::default().endpoint.seed);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[endpoint]
seed = 42

[transport]
initial_max_data = 4096

[logging]
level = "debug"
"#
        )
        .unwrap();

        let config = load_config_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.endpoint.seed, 42);
        assert_eq!(config.endpoint.max_datagram_size, 1200);
        assert_eq!(config.transport.initial_max_data, Some(4096));
        assert_eq!(config.transport.initial_max_streams_bidi, Some(100));
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[endpoint\nseed = ").unwrap();
        let err = load_config_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML config"));
    }

    #[test]
    fn test_default_config_round_trips() {
        let text = default_config_toml().unwrap();
        let parsed: ProbeConfig = toml::from_str(&text).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.transport.initial_max_data, ProbeConfig::default().transport.initial_max_data);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = ProbeConfig::default();
        let cli = CliArgs {
            log_level: Some("warn".to_string()),
            json: true,
            seed: Some(9),
            ..CliArgs::default()
        };
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert!(config.logging.json_format);
        assert_eq!(config.endpoint.seed, 9);
    }

    #[test]
    fn test_invalid_cli_log_level_is_ignored() {
        let mut config = ProbeConfig::default();
        let cli = CliArgs {
            log_level: Some("loud".to_string()),
            ..CliArgs::default()
        };
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_negative_env_seed_is_an_error() {
        std::env::set_var("QUICPROBE_ENDPOINT__SEED", "-1");
        let mut config = ProbeConfig::default();
        let result = apply_env_overrides(&mut config);
        std::env::remove_var("QUICPROBE_ENDPOINT__SEED");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("endpoint.seed"));
        assert_eq!(config.endpoint.seed, ProbeConfig::default().endpoint.seed);
    }

    #[test]
    fn test_negative_file_seed_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[endpoint]\nseed = -1").unwrap();
        assert!(load_config_file(file.path().to_str().unwrap()).is_err());
    }
}

//! Translation from file/CLI configuration to endpoint configuration, plus
//! the platform directories the binary reads and writes.

use std::path::PathBuf;
use std::time::Duration;

use relay_config::{CliArgs, ConfigError, FramingMode, NetworkConfig};
use relay_net::{ClientConfig, FrameConfig, Framing, ServerConfig};

const APP_NAME: &str = "relay";

/// Directory holding `config.ron`: `--config` if given, else the OS config dir.
pub fn config_dir(args: &CliArgs) -> Result<PathBuf, ConfigError> {
    match &args.config {
        Some(dir) => Ok(dir.clone()),
        None => dirs::config_dir()
            .map(|base| base.join(APP_NAME))
            .ok_or(ConfigError::NoConfigDir),
    }
}

/// Directory for JSON log files.
pub fn log_dir(config_dir: &std::path::Path) -> PathBuf {
    dirs::data_local_dir()
        .map(|base| base.join(APP_NAME).join("logs"))
        .unwrap_or_else(|| config_dir.join("logs"))
}

/// Wire framing selected by the configuration.
pub fn framing(network: &NetworkConfig) -> Framing {
    match network.framing {
        FramingMode::Raw => Framing::default(),
        FramingMode::LengthPrefixed => Framing::LengthPrefixed(FrameConfig {
            max_payload_size: network.max_payload_size,
        }),
    }
}

/// Server settings; an invalid address or port falls back to the default endpoint.
pub fn server_config(network: &NetworkConfig) -> ServerConfig {
    ServerConfig {
        framing: framing(network),
        write_timeout: network.write_timeout_ms.map(Duration::from_millis),
        event_capacity: network.event_capacity,
        ..ServerConfig::new(&network.address, network.port)
    }
}

/// Client settings; the address is validated when connecting.
pub fn client_config(network: &NetworkConfig) -> ClientConfig {
    ClientConfig {
        framing: framing(network),
        connect_timeout: network.connect_timeout_ms.map(Duration::from_millis),
        write_timeout: network.write_timeout_ms.map(Duration::from_millis),
        event_capacity: network.event_capacity,
        ..ClientConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_net::EndpointConfig;

    #[test]
    fn test_server_config_from_defaults() {
        let config = server_config(&NetworkConfig::default());
        assert_eq!(config.endpoint, EndpointConfig::default());
        assert_eq!(config.framing, Framing::default());
        assert_eq!(config.write_timeout, None);
    }

    #[test]
    fn test_invalid_port_falls_back() {
        let network = NetworkConfig {
            address: "10.0.0.1".to_string(),
            port: 99_999,
            ..NetworkConfig::default()
        };
        assert_eq!(server_config(&network).endpoint, EndpointConfig::default());
    }

    #[test]
    fn test_length_prefixed_uses_payload_limit() {
        let network = NetworkConfig {
            framing: FramingMode::LengthPrefixed,
            max_payload_size: 64,
            connect_timeout_ms: Some(250),
            ..NetworkConfig::default()
        };
        let client = client_config(&network);
        assert_eq!(
            client.framing,
            Framing::LengthPrefixed(FrameConfig {
                max_payload_size: 64
            })
        );
        assert_eq!(client.connect_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_explicit_config_dir_wins() {
        let args = CliArgs {
            config: Some(PathBuf::from("/tmp/relay-test")),
            ..Default::default()
        };
        assert_eq!(config_dir(&args).unwrap(), PathBuf::from("/tmp/relay-test"));
    }
}

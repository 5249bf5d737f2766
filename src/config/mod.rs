//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::store::ServerEntryFilter;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Client configuration
    pub client: ClientConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| crate::Error::Config(format!("reading {}: {err}", path.display())))?;

        toml::from_str(&content)
            .map_err(|err| crate::Error::Config(format!("parsing {}: {err}", path.display())))
    }

    /// Write the configuration back out as TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|err| crate::Error::Config(format!("encoding config: {err}")))?;

        std::fs::write(path, content)
            .map_err(|err| crate::Error::Config(format!("writing {}: {err}", path.display())))
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory for the persistent datastore
    pub data_store_directory: String,
    /// Egress region constraint; empty for any region
    pub egress_region: String,
    /// Tunnel protocol whitelist; empty for any protocol
    pub limit_tunnel_protocols: Vec<String>,
    /// Identifier of the current network, scoping dial parameter replay
    pub network_id: String,
    /// Optional single target server entry (hex-encoded), bypassing the store
    pub target_server_entry: Option<String>,
    /// Pinned TLS profile name; selected per dial when absent
    pub tls_profile: Option<String>,
    /// PEM file of additional trusted root CAs
    pub trusted_ca_certificates_file: Option<String>,
    /// Hex key enabling obfuscated session tickets
    pub obfuscated_session_ticket_key: Option<String>,
    /// Disable certificate verification (endpoints authenticate at the
    /// inner channel)
    pub skip_certificate_verification: bool,
    /// File of hex-encoded server list entries to ingest at startup
    pub server_list_file: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_store_directory: ".mirage".to_string(),
            egress_region: String::new(),
            limit_tunnel_protocols: Vec::new(),
            network_id: "default".to_string(),
            target_server_entry: None,
            tls_profile: None,
            trusted_ca_certificates_file: None,
            obfuscated_session_ticket_key: None,
            skip_certificate_verification: true,
            server_list_file: None,
        }
    }
}

impl ClientConfig {
    /// The server entry filter implied by this configuration.
    pub fn server_entry_filter(&self) -> ServerEntryFilter {
        ServerEntryFilter {
            egress_region: self.egress_region.clone(),
            limit_tunnel_protocols: self.limit_tunnel_protocols.clone(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log file path; stderr when absent
    pub file: Option<String>,
    /// Omit server addresses and network ids from log output. Logs from a
    /// circumvention client are themselves sensitive; identifiers stay out
    /// unless an operator opts in for diagnostics.
    pub redact_identifiers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            redact_identifiers: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.client.egress_region = "CA".to_string();
        config.client.limit_tunnel_protocols = vec!["obfuscated-tls".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.client.egress_region, "CA");
        assert_eq!(
            loaded.client.server_entry_filter().limit_tunnel_protocols,
            vec!["obfuscated-tls".to_string()]
        );
        // Identifier redaction is on unless explicitly disabled.
        assert!(loaded.logging.redact_identifiers);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/no/such/config.toml").is_err());
    }
}

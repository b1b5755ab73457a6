//! Agent configuration.
//!
//! Loaded from a YAML file. Validation runs before anything else at startup:
//! placeholder values shipped in sample configs are rejected outright.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AgentError, AgentResult};

/// Placeholder values that mean "the operator never edited the sample".
const PLACEHOLDER_API_KEY: &str = "your-api-key-here";
const PLACEHOLDER_IP: &str = "123.45.67.89";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server: ServerSection,
    #[serde(default)]
    pub agent: AgentSection,
    pub network: NetworkSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub intervals: IntervalsSection,
    /// Optional WebSocket sink for deploy progress frames.
    #[serde(default)]
    pub live_update_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Orchestration server base URL (e.g. https://api.example.com)
    pub url: String,
    /// Bearer credential for every call
    pub api_key: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSection {
    /// Minted on first start when absent and persisted back to this file.
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    pub public_ip: String,
    pub ssh_port: u16,
    pub rental_port_1: u16,
    pub rental_port_2: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: std::path::PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalsSection {
    #[serde(default = "default_sample")]
    pub sample_secs: u64,
    #[serde(default = "default_health")]
    pub health_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_metrics_push")]
    pub metrics_push_secs: u64,
    #[serde(default = "default_health_push")]
    pub health_push_secs: u64,
    #[serde(default = "default_sweep")]
    pub duration_sweep_secs: u64,
    #[serde(default = "default_poll")]
    pub command_poll_secs: u64,
}

impl Default for IntervalsSection {
    fn default() -> Self {
        Self {
            sample_secs: default_sample(),
            health_secs: default_health(),
            heartbeat_secs: default_heartbeat(),
            metrics_push_secs: default_metrics_push(),
            health_push_secs: default_health_push(),
            duration_sweep_secs: default_sweep(),
            command_poll_secs: default_poll(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_db_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/rignode/agent.db")
}
fn default_sample() -> u64 {
    30
}
fn default_health() -> u64 {
    60
}
fn default_heartbeat() -> u64 {
    30
}
fn default_metrics_push() -> u64 {
    60
}
fn default_health_push() -> u64 {
    120
}
fn default_sweep() -> u64 {
    60
}
fn default_poll() -> u64 {
    10
}

impl AgentConfig {
    pub fn load(path: &Path) -> AgentResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;
        serde_yaml::from_str(&data)
            .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> AgentResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_yaml::to_string(self)
            .map_err(|e| AgentError::Config(format!("serialize config: {e}")))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Reject placeholders, zero intervals, and port collisions.
    pub fn validate(&self) -> AgentResult<()> {
        if self.server.url.is_empty() || !self.server.url.starts_with("http") {
            return Err(AgentError::Config("server.url must be an http(s) url".into()));
        }
        if self.server.api_key.is_empty() || self.server.api_key == PLACEHOLDER_API_KEY {
            return Err(AgentError::Config(
                "server.api_key is missing or still the sample placeholder".into(),
            ));
        }
        if self.server.timeout_secs == 0 {
            return Err(AgentError::Config("server.timeout_secs must be > 0".into()));
        }
        if self.network.public_ip.is_empty() || self.network.public_ip == PLACEHOLDER_IP {
            return Err(AgentError::Config(
                "network.public_ip is missing or still the sample placeholder".into(),
            ));
        }
        let ports = [
            self.network.ssh_port,
            self.network.rental_port_1,
            self.network.rental_port_2,
        ];
        if ports.iter().any(|p| *p == 0) {
            return Err(AgentError::Config("network ports must be non-zero".into()));
        }
        if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
            return Err(AgentError::Config("network ports must be distinct".into()));
        }
        let intervals = [
            self.intervals.sample_secs,
            self.intervals.health_secs,
            self.intervals.heartbeat_secs,
            self.intervals.metrics_push_secs,
            self.intervals.health_push_secs,
            self.intervals.duration_sweep_secs,
            self.intervals.command_poll_secs,
        ];
        if intervals.iter().any(|i| *i == 0) {
            return Err(AgentError::Config("all loop intervals must be > 0".into()));
        }
        Ok(())
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    pub fn network_binding(&self) -> rig_proto::NetworkBinding {
        rig_proto::NetworkBinding {
            public_ip: self.network.public_ip.clone(),
            ssh_port: self.network.ssh_port,
            rental_port_1: self.network.rental_port_1,
            rental_port_2: self.network.rental_port_2,
        }
    }

    /// Sample config for `rignode init-config`.
    pub fn sample() -> Self {
        Self {
            server: ServerSection {
                url: "https://api.example.com".to_string(),
                api_key: PLACEHOLDER_API_KEY.to_string(),
                timeout_secs: default_timeout(),
            },
            agent: AgentSection::default(),
            network: NetworkSection {
                public_ip: PLACEHOLDER_IP.to_string(),
                ssh_port: 22022,
                rental_port_1: 40001,
                rental_port_2: 40002,
            },
            storage: StorageSection::default(),
            intervals: IntervalsSection::default(),
            live_update_url: None,
        }
    }
}

/// Mint a fresh agent identity: `agent-` plus 12 hex characters.
pub fn mint_agent_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 6];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("agent-{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AgentConfig {
        let mut config = AgentConfig::sample();
        config.server.api_key = "key-live-1234".to_string();
        config.network.public_ip = "203.0.113.5".to_string();
        config
    }

    #[test]
    fn sample_config_fails_validation() {
        // The shipped sample must not run as-is.
        assert!(AgentConfig::sample().validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn placeholder_api_key_rejected() {
        let mut config = valid_config();
        config.server.api_key = PLACEHOLDER_API_KEY.to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn placeholder_ip_rejected() {
        let mut config = valid_config();
        config.network.public_ip = PLACEHOLDER_IP.to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("public_ip"));
    }

    #[test]
    fn duplicate_ports_rejected() {
        let mut config = valid_config();
        config.network.rental_port_1 = config.network.ssh_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_interval_rejected() {
        let mut config = valid_config();
        config.intervals.duration_sweep_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_http_url_rejected() {
        let mut config = valid_config();
        config.server.url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_roundtrip_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = valid_config();
        config.agent.id = Some("agent-abc123def456".to_string());
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.agent.id.as_deref(), Some("agent-abc123def456"));
        assert_eq!(loaded.network.ssh_port, 22022);
        assert_eq!(loaded.intervals.command_poll_secs, 10);
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(AgentConfig::load(Path::new("/nonexistent/rignode.yaml")).is_err());
    }

    #[test]
    fn partial_yaml_gets_interval_defaults() {
        let yaml = r#"
server:
  url: https://api.example.com
  api_key: key-live-1234
network:
  public_ip: 203.0.113.5
  ssh_port: 22022
  rental_port_1: 40001
  rental_port_2: 40002
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.intervals.sample_secs, 30);
        assert_eq!(config.server.timeout_secs, 30);
        assert!(config.agent.id.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn minted_agent_id_shape() {
        let id = mint_agent_id();
        assert!(id.starts_with("agent-"));
        assert_eq!(id.len(), "agent-".len() + 12);
        assert!(id["agent-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(mint_agent_id(), mint_agent_id());
    }
}

use crate::messaging::framer::{FramerConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MIN_LARGE_MESSAGE_SIZE};
use crate::server::security::{Role, RoleBasedSecurity};
use crate::settings::address_settings::AddressSettings;
use crate::settings::repository::HierarchicalRepository;
use crate::settings::wildcard::Pattern;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a broker process and its clients.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub address_settings: Vec<AddressSettingsEntry>,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_large_messages_dir")]
    pub large_messages_dir: PathBuf,
    #[serde(default = "default_settings_cache_capacity")]
    pub settings_cache_capacity: usize,
    #[serde(default = "default_chunk_size")]
    pub large_message_chunk_size: usize,
    #[serde(default)]
    pub security_enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            large_messages_dir: default_large_messages_dir(),
            settings_cache_capacity: default_settings_cache_capacity(),
            large_message_chunk_size: default_chunk_size(),
            security_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Bodies strictly larger than this are streamed as large messages.
    #[serde(default = "default_min_large_message_size")]
    pub min_large_message_size: usize,
    #[serde(default)]
    pub compress_large_message: bool,
    #[serde(default = "default_chunk_size")]
    pub large_message_chunk_size: usize,
    #[serde(default = "default_producer_window_size")]
    pub producer_window_size: usize,
    #[serde(default = "default_max_io_retry")]
    pub max_io_retry: u32,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_timeout_ms")]
    pub locate_timeout_ms: u64,
    /// Producer credit wait; zero waits forever.
    #[serde(default = "default_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Spool directory for received large bodies; the system temp dir when
    /// unset.
    #[serde(default)]
    pub large_messages_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_large_message_size: default_min_large_message_size(),
            compress_large_message: false,
            large_message_chunk_size: default_chunk_size(),
            producer_window_size: default_producer_window_size(),
            max_io_retry: default_max_io_retry(),
            reconnect_attempts: default_reconnect_attempts(),
            locate_timeout_ms: default_timeout_ms(),
            call_timeout_ms: default_timeout_ms(),
            large_messages_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn framer_config(&self) -> FramerConfig {
        FramerConfig {
            min_large_message_size: self.min_large_message_size,
            chunk_size: self.large_message_chunk_size,
            compress: self.compress_large_message,
            credit_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_level: Option<String>,
}

/// One `[[address_settings]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct AddressSettingsEntry {
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(flatten)]
    pub settings: AddressSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub roles: Vec<SecurityRoleEntry>,
    /// User name to granted role names.
    #[serde(default)]
    pub users: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityRoleEntry {
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(default)]
    pub roles: Vec<Role>,
}

fn default_large_messages_dir() -> PathBuf {
    PathBuf::from("data/large-messages")
}

fn default_settings_cache_capacity() -> usize {
    1024
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_min_large_message_size() -> usize {
    DEFAULT_MIN_LARGE_MESSAGE_SIZE
}

fn default_producer_window_size() -> usize {
    1024 * 1024
}

fn default_max_io_retry() -> u32 {
    5
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Config {
    /// Load configuration from the path in HORNETQ_CONFIG, or
    /// `config/hornetq.toml` when unset.
    /// Applies HORNETQ_LOG_LEVEL over `telemetry.log_level` after parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.large_message_chunk_size == 0 {
            bail!("broker.large_message_chunk_size must be > 0");
        }
        if self.client.large_message_chunk_size == 0 {
            bail!("client.large_message_chunk_size must be > 0");
        }
        if self.client.large_message_chunk_size > self.client.producer_window_size {
            bail!(
                "client.large_message_chunk_size {} exceeds producer_window_size {}",
                self.client.large_message_chunk_size,
                self.client.producer_window_size
            );
        }
        if self.client.max_io_retry == 0 {
            bail!("client.max_io_retry must be > 0");
        }
        if self.client.reconnect_attempts == 0 {
            bail!("client.reconnect_attempts must be > 0");
        }
        for entry in &self.address_settings {
            Pattern::parse(&entry.pattern)
                .with_context(|| format!("address_settings entry '{}'", entry.pattern))?;
        }
        for entry in &self.security.roles {
            Pattern::parse(&entry.pattern)
                .with_context(|| format!("security.roles entry '{}'", entry.pattern))?;
        }
        Ok(())
    }

    /// Address settings repository seeded with broker defaults and every
    /// `[[address_settings]]` entry.
    pub fn build_settings_repository(&self) -> Result<HierarchicalRepository<AddressSettings>> {
        let repository = HierarchicalRepository::with_cache_capacity(
            AddressSettings::broker_defaults(),
            self.broker.settings_cache_capacity,
        );
        for entry in &self.address_settings {
            repository
                .add_match(&entry.pattern, entry.settings.clone())
                .with_context(|| format!("address_settings entry '{}'", entry.pattern))?;
        }
        Ok(repository)
    }

    pub fn build_security(&self) -> Result<RoleBasedSecurity> {
        let mut security = RoleBasedSecurity::new();
        for entry in &self.security.roles {
            security
                .add_roles(&entry.pattern, entry.roles.clone())
                .with_context(|| format!("security.roles entry '{}'", entry.pattern))?;
        }
        for (user, roles) in &self.security.users {
            security = security.with_user(user.clone(), roles.iter().cloned());
        }
        Ok(security)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("HORNETQ_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("HORNETQ_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/hornetq.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::security::{CheckType, SecurityManager};
    use crate::settings::address_settings::AddressFullPolicy;
    use tempfile::tempdir;

    const SAMPLE: &str = r##"
[broker]
large_messages_dir = "/var/lib/hornetq/large"
security_enabled = true

[client]
min_large_message_size = 1024
compress_large_message = true
large_messages_dir = "/var/lib/hornetq/client-large"

[telemetry]
log_level = "debug"

[[address_settings]]
match = "#"
dead_letter_address = "DLA"
max_delivery_attempts = 3

[[address_settings]]
match = "orders.#"
address_full_policy = "FAIL"
max_size_bytes = 4096

[[security.roles]]
match = "orders.#"
roles = [{ name = "writer", send = true }]

[security.users]
alice = ["writer"]
"##;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.broker.large_messages_dir, PathBuf::from("data/large-messages"));
        assert_eq!(cfg.broker.settings_cache_capacity, 1024);
        assert_eq!(cfg.client.min_large_message_size, 102_400);
        assert_eq!(cfg.client.producer_window_size, 1024 * 1024);
        assert_eq!(cfg.client.max_io_retry, 5);
        assert!(cfg.client.large_messages_dir.is_none());
        assert!(cfg.telemetry.log_level.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_toml_and_build_runtime_objects() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "hornetq.toml", SAMPLE);
        let cfg = Config::load(&path).unwrap();
        cfg.validate().unwrap();
        assert!(cfg.broker.security_enabled);
        assert!(cfg.client.framer_config().compress);
        assert_eq!(
            cfg.client.large_messages_dir.as_deref(),
            Some(Path::new("/var/lib/hornetq/client-large"))
        );
        assert_eq!(cfg.telemetry.log_level.as_deref(), Some("debug"));

        let repo = cfg.build_settings_repository().unwrap();
        let orders = repo.get_match("orders.eu");
        assert_eq!(orders.address_full_policy(), AddressFullPolicy::Fail);
        assert_eq!(orders.max_size_bytes(), 4096);
        assert_eq!(orders.dead_letter_address.as_deref(), Some("DLA"));
        assert_eq!(orders.max_delivery_attempts(), 3);

        let security = cfg.build_security().unwrap();
        assert!(security.validate(Some("alice"), "orders.eu", CheckType::Send));
        assert!(!security.validate(Some("alice"), "orders.eu", CheckType::Consume));
        assert!(!security.validate(Some("bob"), "orders.eu", CheckType::Send));
    }

    #[test]
    fn test_load_json_by_extension() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "hornetq.json",
            r#"{"client": {"max_io_retry": 2}, "address_settings": [{"match": "a.*", "last_value_queue": true}]}"#,
        );
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.client.max_io_retry, 2);
        assert!(cfg.build_settings_repository().unwrap().get_match("a.b").is_last_value_queue());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg: Config = toml::from_str("[[address_settings]]\nmatch = \"a..b\"\n").unwrap();
        assert!(cfg.validate().is_err());
        assert!(cfg.build_settings_repository().is_err());

        let cfg: Config = toml::from_str("[client]\nmax_io_retry = 0\n").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("max_io_retry"));

        let cfg: Config = toml::from_str(
            "[client]\nlarge_message_chunk_size = 2048\nproducer_window_size = 1024\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempdir().unwrap();
        let err = Config::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(format!("{err:?}").contains("absent.toml"));
    }
}

//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via ELECTRUM_CONFIG or `from_file`)
//! 3. Environment variables

use electrum_protocol::{TextEncoding, DEFAULT_TCP_PORT};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default idle window before the first byte arrives (5 seconds).
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5_000;

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address and transport selection.
    pub server: ServerConfig,
    /// Socket behaviour applied at connect time.
    pub socket: SocketConfig,
    /// TLS settings (only used for `tls`/`ssl`).
    pub tls: TlsOptions,
    /// Reconnection surface consumed by the layer above the client.
    pub persistence: PersistenceConfig,
}

impl ClientConfig {
    /// Creates a configuration for the given server.
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            server: ServerConfig {
                host: host.into(),
                port,
                protocol,
            },
            ..Self::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("ELECTRUM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Applies `ELECTRUM_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(&|key: &str| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: Lookup<'_>) -> Result<(), ConfigError> {
        self.server.apply_overrides(var)?;
        self.socket.apply_overrides(var)?;
        self.tls.apply_overrides(var);
        self.persistence.apply_overrides(var);
        Ok(())
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server.host must not be empty".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must not be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transport selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    /// Plain TCP.
    #[default]
    Tcp,
    /// TLS over TCP. Accepts both `tls` and `ssl`.
    Tls,
}

impl Protocol {
    pub fn is_secure(&self) -> bool {
        matches!(self, Protocol::Tls)
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "tls" | "ssl" => Ok(Protocol::Tls),
            other => Err(ConfigError::ValidationError(format!(
                "unsupported protocol '{}' (expected tcp, tls or ssl)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.to_string()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Tls => write!(f, "tls"),
        }
    }
}

/// Server address configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            protocol: Protocol::Tcp,
        }
    }
}

impl ServerConfig {
    fn apply_overrides(&mut self, var: Lookup<'_>) -> Result<(), ConfigError> {
        if let Some(host) = var("ELECTRUM_HOST") {
            self.host = host;
        }

        if let Some(port) = var("ELECTRUM_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }

        if let Some(protocol) = var("ELECTRUM_PROTOCOL") {
            self.protocol = protocol.parse()?;
        }

        Ok(())
    }
}

/// Socket configuration, buffered until connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Idle window before the first received byte, in milliseconds (0 = disabled).
    pub idle_timeout_ms: u64,
    /// Enable TCP keep-alive.
    pub keep_alive: bool,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// How inbound documents are decoded.
    pub encoding: TextEncoding,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            keep_alive: true,
            no_delay: true,
            encoding: TextEncoding::Utf8,
        }
    }
}

impl SocketConfig {
    fn apply_overrides(&mut self, var: Lookup<'_>) -> Result<(), ConfigError> {
        if let Some(timeout) = var("ELECTRUM_IDLE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.idle_timeout_ms = ms;
            }
        }

        if let Some(keep_alive) = var("ELECTRUM_KEEP_ALIVE") {
            self.keep_alive = parse_flag(&keep_alive);
        }

        if let Some(no_delay) = var("ELECTRUM_NO_DELAY") {
            self.no_delay = parse_flag(&no_delay);
        }

        if let Some(encoding) = var("ELECTRUM_ENCODING") {
            self.encoding = encoding.parse().map_err(ConfigError::ValidationError)?;
        }

        Ok(())
    }

    /// Returns the idle timeout as a Duration, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// TLS options for the secure transport.
///
/// Certificate verification is OFF by default: Electrum servers commonly
/// use self-signed certificates. Set `verify` to validate against
/// `ca_cert_path` or the bundled web PKI roots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub verify: bool,
    /// PEM-encoded CA certificate(s) used when `verify` is set.
    pub ca_cert_path: Option<PathBuf>,
    /// Server name for SNI (defaults to the configured host).
    pub server_name: Option<String>,
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verification(mut self) -> Self {
        self.verify = true;
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.verify = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn apply_overrides(&mut self, var: Lookup<'_>) {
        if let Some(verify) = var("ELECTRUM_TLS_VERIFY") {
            self.verify = parse_flag(&verify);
        }
        if let Some(path) = var("ELECTRUM_CA_CERT") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Some(name) = var("ELECTRUM_TLS_SERVER_NAME") {
            self.server_name = Some(name);
        }
    }
}

/// Reconnection policy surface. The client itself never acts on these
/// values; they are carried for the supervising layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Delay between reconnection attempts in milliseconds.
    pub retry_period_ms: u64,
    /// Maximum reconnection attempts.
    pub max_retry: u32,
    /// Keep-alive ping interval in milliseconds.
    pub ping_period_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retry_period_ms: 10_000,
            max_retry: 1_000,
            ping_period_ms: 120_000,
        }
    }
}

impl PersistenceConfig {
    fn apply_overrides(&mut self, var: Lookup<'_>) {
        if let Some(period) = var("ELECTRUM_RETRY_PERIOD_MS") {
            if let Ok(ms) = period.parse() {
                self.retry_period_ms = ms;
            }
        }
        if let Some(max) = var("ELECTRUM_MAX_RETRY") {
            if let Ok(n) = max.parse() {
                self.max_retry = n;
            }
        }
        if let Some(period) = var("ELECTRUM_PING_PERIOD_MS") {
            if let Ok(ms) = period.parse() {
                self.ping_period_ms = ms;
            }
        }
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.server.port, 50001);
        assert_eq!(config.server.protocol, Protocol::Tcp);
        assert_eq!(config.socket.idle_timeout(), Some(Duration::from_secs(5)));
        assert!(config.socket.keep_alive);
        assert!(config.socket.no_delay);
        assert!(!config.tls.verify);
        assert_eq!(config.persistence.retry_period(), Duration::from_secs(10));
        assert_eq!(config.persistence.max_retry, 1000);
        assert_eq!(config.persistence.ping_period(), Duration::from_secs(120));
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("tls".parse::<Protocol>().unwrap(), Protocol::Tls);
        assert_eq!("SSL".parse::<Protocol>().unwrap(), Protocol::Tls);
        let err = "udp".parse::<Protocol>().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert!(err.to_string().contains("udp"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = ClientConfig::new("electrum.example.org", 50002, Protocol::Tls);
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("protocol: tls"));
        let parsed: ClientConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.host, "electrum.example.org");
        assert_eq!(parsed.server.protocol, Protocol::Tls);
    }

    #[test]
    fn test_yaml_rejects_unknown_protocol() {
        let yaml = "server:\n  host: h\n  port: 1\n  protocol: quic\n";
        assert!(serde_yaml::from_str::<ClientConfig>(yaml).is_err());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  host: fulcrum.local\n  protocol: ssl\nsocket:\n  idle_timeout_ms: 0\n  encoding: utf8-lossy"
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.host, "fulcrum.local");
        assert_eq!(config.server.port, 50001);
        assert_eq!(config.server.protocol, Protocol::Tls);
        assert_eq!(config.socket.idle_timeout(), None);
        assert_eq!(config.socket.encoding, TextEncoding::Utf8Lossy);
        assert!(config.socket.keep_alive);
    }

    #[test]
    fn test_from_file_missing() {
        let err = ClientConfig::from_file("/nonexistent/electrum.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_, _)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.yaml");
        let mut config = ClientConfig::new("h", 60001, Protocol::Tcp);
        config.tls = TlsOptions::new().with_server_name("sni.example");
        config.save(&path).unwrap();

        let loaded = ClientConfig::from_file(&path).unwrap();
        assert_eq!(loaded.server.port, 60001);
        assert_eq!(loaded.tls.server_name.as_deref(), Some("sni.example"));
    }

    #[test]
    fn test_overrides() {
        let mut config = ClientConfig::default();
        let var = lookup(&[
            ("ELECTRUM_HOST", "10.0.0.1"),
            ("ELECTRUM_PORT", "50002"),
            ("ELECTRUM_PROTOCOL", "ssl"),
            ("ELECTRUM_IDLE_TIMEOUT_MS", "250"),
            ("ELECTRUM_NO_DELAY", "false"),
            ("ELECTRUM_TLS_VERIFY", "1"),
            ("ELECTRUM_MAX_RETRY", "3"),
        ]);
        config.apply_overrides(&var).unwrap();

        assert_eq!(config.server.host, "10.0.0.1");
        assert_eq!(config.server.port, 50002);
        assert_eq!(config.server.protocol, Protocol::Tls);
        assert_eq!(config.socket.idle_timeout(), Some(Duration::from_millis(250)));
        assert!(!config.socket.no_delay);
        assert!(config.tls.verify);
        assert_eq!(config.persistence.max_retry, 3);
    }

    #[test]
    fn test_override_bad_protocol_is_error() {
        let mut config = ClientConfig::default();
        let var = lookup(&[("ELECTRUM_PROTOCOL", "websocket")]);
        assert!(config.apply_overrides(&var).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());
        config.server.port = 0;
        assert!(config.validate().is_err());
        config.server.port = 1;
        config.server.host = " ".to_string();
        assert!(config.validate().is_err());
    }
}

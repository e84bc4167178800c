//! Configuration system for xcp
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (XCP_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::discovery::ProbeOptions;
use crate::error::{Error, Result};
use crate::node::{NodeOptions, SettleWindow, DEFAULT_CONNECT_TIMEOUT};
use crate::relay::{DEFAULT_QUEUE_CAPACITY, DEFAULT_SEND_TIMEOUT};
use crate::session::SessionName;

/// Discovery port; `-p/--port` sets the relay port to the same value
pub const DEFAULT_PORT: u16 = 2975;

/// Default discovery group (organization-local multicast scope)
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 29, 75);

/// Main xcp configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XcpConfig {
    /// Session selection
    pub session: SessionSettings,

    /// Relay listener settings (manager role)
    pub relay: RelaySettings,

    /// Discovery protocol settings
    pub discovery: DiscoverySettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Session settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Session to join (random if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Relay listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Address the relay server binds
    pub bind: IpAddr,

    /// Relay server port (0 lets the OS pick; the reply advertises it)
    pub port: u16,

    /// Payloads queued per endpoint before senders have to wait
    pub outbound_queue: usize,

    /// How long a sender waits on a full queue before the reader is dropped (milliseconds)
    pub send_timeout_ms: u64,

    /// How long a follower retries connecting to its manager (milliseconds)
    pub connect_timeout_ms: u64,
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Discovery group address (a unicast address disables multicast)
    pub group: Ipv4Addr,

    /// Discovery port
    pub port: u16,

    /// How long a probe waits for a manager (milliseconds)
    pub timeout_ms: u64,

    /// Local IPv4 address to probe from and advertise (auto-detected if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<Ipv4Addr>,

    /// Re-probe once after becoming manager and yield to a lower-addressed rival
    pub settle_check: bool,

    /// Lower bound of the settle delay (milliseconds)
    pub settle_jitter_min_ms: u64,

    /// Upper bound of the settle delay (milliseconds)
    pub settle_jitter_max_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            outbound_queue: DEFAULT_QUEUE_CAPACITY,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            timeout_ms: 2000,
            interface: None,
            settle_check: true,
            settle_jitter_min_ms: 250,
            settle_jitter_max_ms: 1000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

/// Settings given on the command line, applied last
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub session: Option<String>,
    pub port: Option<u16>,
    pub group: Option<Ipv4Addr>,
    pub interface: Option<Ipv4Addr>,
    pub timeout_ms: Option<u64>,
}

impl XcpConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            Some(PathBuf::from("xcp.toml")),
            // User config directory
            dirs::config_dir().map(|p| p.join("xcp").join("config.toml")),
            // Home directory
            dirs::home_dir().map(|p| p.join(".xcp").join("config.toml")),
        ];

        for path in search_paths.iter().flatten() {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Session
        if let Ok(val) = std::env::var("XCP_SESSION") {
            if !val.is_empty() {
                self.session.name = Some(val);
            }
        }

        // Relay settings
        if let Ok(val) = std::env::var("XCP_BIND") {
            if let Ok(addr) = val.parse() {
                self.relay.bind = addr;
            }
        }
        if let Ok(val) = std::env::var("XCP_SEND_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.relay.send_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("XCP_PORT") {
            if let Ok(n) = val.parse() {
                self.relay.port = n;
                self.discovery.port = n;
            }
        }

        // Discovery settings
        if let Ok(val) = std::env::var("XCP_GROUP") {
            if let Ok(addr) = val.parse() {
                self.discovery.group = addr;
            }
        }
        if let Ok(val) = std::env::var("XCP_DISCOVERY_PORT") {
            if let Ok(n) = val.parse() {
                self.discovery.port = n;
            }
        }
        if let Ok(val) = std::env::var("XCP_DISCOVERY_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.discovery.timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("XCP_INTERFACE") {
            if let Ok(addr) = val.parse() {
                self.discovery.interface = Some(addr);
            }
        }
        if let Ok(val) = std::env::var("XCP_SETTLE_CHECK") {
            self.discovery.settle_check = val.to_lowercase() == "true" || val == "1";
        }

        // Logging settings
        if let Ok(val) = std::env::var("XCP_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("XCP_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("XCP_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Apply command-line settings and re-validate
    pub fn apply_cli(&mut self, overrides: &CliOverrides) -> Result<()> {
        if let Some(ref name) = overrides.session {
            self.session.name = Some(name.clone());
        }
        if let Some(port) = overrides.port {
            self.relay.port = port;
            self.discovery.port = port;
        }
        if let Some(group) = overrides.group {
            self.discovery.group = group;
        }
        if let Some(interface) = overrides.interface {
            self.discovery.interface = Some(interface);
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            self.discovery.timeout_ms = timeout_ms;
        }
        self.validate()
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref name) = self.session.name {
            SessionName::new(name.as_str())?;
        }

        if self.relay.outbound_queue == 0 {
            return Err(Error::config_field_invalid(
                "relay.outbound_queue",
                "outbound queue must hold at least one payload",
            ));
        }
        if self.relay.send_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "relay.send_timeout_ms",
                "send timeout must be greater than zero",
            ));
        }
        if self.discovery.port == 0 {
            return Err(Error::config_field_invalid("discovery.port", "port must be non-zero"));
        }
        if self.discovery.timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "discovery.timeout_ms",
                "probe timeout must be greater than zero",
            ));
        }
        if self.discovery.settle_jitter_min_ms > self.discovery.settle_jitter_max_ms {
            return Err(Error::config_field_invalid(
                "discovery.settle_jitter_min_ms",
                format!(
                    "settle jitter minimum ({}) exceeds maximum ({})",
                    self.discovery.settle_jitter_min_ms, self.discovery.settle_jitter_max_ms
                ),
            ));
        }
        if let Some(interface) = self.discovery.interface {
            if interface.is_unspecified() || interface.is_multicast() {
                return Err(Error::config_field_invalid(
                    "discovery.interface",
                    format!("'{}' is not a usable interface address", interface),
                ));
            }
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Discovery group as a socket address
    pub fn group_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.discovery.group, self.discovery.port)
    }

    /// Build node options for a resolved session
    pub fn node_options(&self, session: SessionName) -> NodeOptions {
        let mut probe = ProbeOptions::new(
            self.group_addr(),
            Duration::from_millis(self.discovery.timeout_ms),
        );
        probe.interface = self.discovery.interface;

        let settle = self.discovery.settle_check.then(|| SettleWindow {
            min: Duration::from_millis(self.discovery.settle_jitter_min_ms),
            max: Duration::from_millis(self.discovery.settle_jitter_max_ms),
        });

        NodeOptions {
            session,
            relay_bind: self.relay.bind,
            relay_port: self.relay.port,
            queue_capacity: self.relay.outbound_queue,
            send_timeout: Duration::from_millis(self.relay.send_timeout_ms),
            responder_group: self.group_addr(),
            probe,
            settle,
            connect_timeout: Duration::from_millis(self.relay.connect_timeout_ms),
            announce: true,
        }
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::config_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("xcp")
                .join("config.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# xcp configuration

[session]
# Session to join (a random 6-character name is used if not set)
# name = "room1"

[relay]
# Address the relay server binds when this process manages the session
bind = "0.0.0.0"

# Relay server port; 0 picks a free one, which discovery replies advertise
# (-p/--port sets this and discovery.port together)
port = 0

# Payloads queued per endpoint before senders wait for the reader
outbound_queue = 256

# How long a sender waits on a full queue before that reader is dropped (milliseconds)
send_timeout_ms = 5000

# How long a follower retries connecting to its manager (milliseconds)
connect_timeout_ms = 5000

[discovery]
# Multicast group probed for an existing manager
group = "239.255.29.75"

# Discovery port
port = 2975

# How long to wait for a manager before taking over the session (milliseconds)
timeout_ms = 2000

# Local IPv4 address to probe from and advertise (auto-detected if not set)
# interface = "192.168.1.20"

# Re-probe once after taking over and yield to a manager with a lower address
settle_check = true
settle_jitter_min_ms = 250
settle_jitter_max_ms = 1000

[logging]
# Log level: trace, debug, info, warn, error
level = "warn"

# Log file path (comment out to disable file logging)
# file = "~/.xcp/logs/xcp.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = XcpConfig::default();
        assert!(config.session.name.is_none());
        assert_eq!(config.relay.port, 0);
        assert_eq!(config.relay.send_timeout_ms, 5000);
        assert_eq!(config.discovery.port, 2975);
        assert_eq!(config.discovery.timeout_ms, 2000);
        assert_eq!(config.discovery.group, Ipv4Addr::new(239, 255, 29, 75));
        assert_eq!(config.logging.level, "warn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        env::set_var("XCP_DISCOVERY_TIMEOUT_MS", "750");
        env::set_var("XCP_SETTLE_CHECK", "false");
        env::set_var("XCP_INTERFACE", "10.9.8.7");

        let mut config = XcpConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.discovery.timeout_ms, 750);
        assert!(!config.discovery.settle_check);
        assert_eq!(config.discovery.interface, Some(Ipv4Addr::new(10, 9, 8, 7)));

        // Cleanup
        env::remove_var("XCP_DISCOVERY_TIMEOUT_MS");
        env::remove_var("XCP_SETTLE_CHECK");
        env::remove_var("XCP_INTERFACE");
    }

    #[test]
    fn test_cli_port_sets_both_ports() {
        let mut config = XcpConfig::default();
        config
            .apply_cli(&CliOverrides {
                port: Some(4000),
                session: Some("room1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.relay.port, 4000);
        assert_eq!(config.discovery.port, 4000);
        assert_eq!(config.session.name.as_deref(), Some("room1"));
    }

    #[test]
    fn test_cli_rejects_empty_session() {
        let mut config = XcpConfig::default();
        let err = config
            .apply_cli(&CliOverrides {
                session: Some(String::new()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSessionName { .. }));
    }

    #[test]
    fn test_cli_keeps_session_verbatim() {
        let mut config = XcpConfig::default();
        config
            .apply_cli(&CliOverrides {
                session: Some("team a/b".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.session.name.as_deref(), Some("team a/b"));
    }

    #[test]
    fn test_validation_zero_port() {
        // Relay port 0 means any free port
        let mut config = XcpConfig::default();
        config.relay.port = 0;
        assert!(config.validate().is_ok());

        let mut config = XcpConfig::default();
        config.discovery.port = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "discovery.port"));
    }

    #[test]
    fn test_validation_zero_send_timeout() {
        let mut config = XcpConfig::default();
        config.relay.send_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "relay.send_timeout_ms"));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let mut config = XcpConfig::default();
        config.discovery.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_jitter_order() {
        let mut config = XcpConfig::default();
        config.discovery.settle_jitter_min_ms = 2000;
        config.discovery.settle_jitter_max_ms = 1000;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "discovery.settle_jitter_min_ms"));
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = XcpConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_expansion() {
        let mut config = XcpConfig::default();
        config.logging.file = Some("~/xcp/xcp.log".to_string());
        config.expand_paths();

        assert!(!config.logging.file.unwrap().contains('~'));
    }

    #[test]
    fn test_default_file_parses_to_defaults() {
        let parsed: XcpConfig = toml::from_str(&generate_default_config()).unwrap();
        let defaults = XcpConfig::default();
        assert_eq!(parsed.relay.port, defaults.relay.port);
        assert_eq!(parsed.relay.send_timeout_ms, defaults.relay.send_timeout_ms);
        assert_eq!(parsed.relay.bind, defaults.relay.bind);
        assert_eq!(parsed.discovery.group, defaults.discovery.group);
        assert_eq!(parsed.discovery.settle_jitter_max_ms, defaults.discovery.settle_jitter_max_ms);
        assert_eq!(parsed.logging.level, defaults.logging.level);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[session]
name = "room1"

[relay]
port = 4000

[discovery]
group = "127.0.0.1"
interface = "127.0.0.1"
timeout_ms = 500
settle_check = false

[logging]
level = "debug"
"#;

        let config: XcpConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.session.name, Some("room1".to_string()));
        assert_eq!(config.relay.port, 4000);
        assert_eq!(config.relay.outbound_queue, 256);
        assert_eq!(config.discovery.port, 2975);
        assert_eq!(config.group_addr(), "127.0.0.1:2975".parse().unwrap());
        assert_eq!(config.discovery.interface, Some(Ipv4Addr::LOCALHOST));
        assert!(!config.discovery.settle_check);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_group_must_be_ipv4() {
        let result: std::result::Result<XcpConfig, _> = toml::from_str("[discovery]\ngroup = \"ff02::1\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_node_options() {
        let mut config = XcpConfig::default();
        config.discovery.interface = Some(Ipv4Addr::LOCALHOST);
        let options = config.node_options(SessionName::new("room1").unwrap());

        assert_eq!(options.session.as_str(), "room1");
        assert_eq!(options.relay_port, 0);
        assert_eq!(options.send_timeout, Duration::from_secs(5));
        assert_eq!(options.responder_group, options.probe.group);
        assert_eq!(options.probe.timeout, Duration::from_secs(2));
        assert_eq!(options.probe.interface, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(
            options.settle,
            Some(SettleWindow {
                min: Duration::from_millis(250),
                max: Duration::from_millis(1000),
            })
        );

        config.discovery.settle_check = false;
        assert!(config.node_options(SessionName::new("room1").unwrap()).settle.is_none());
    }

    #[test]
    fn test_init_config_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("xcp.toml");
        let path_str = path.to_str().unwrap();

        let written = init_config(Some(path_str), false).unwrap();
        assert_eq!(written, path);
        assert!(path.exists());

        // Refuses to overwrite without force
        assert!(init_config(Some(path_str), false).is_err());
        assert!(init_config(Some(path_str), true).is_ok());
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let err = XcpConfig::load(Some("/nonexistent/xcp.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }
}

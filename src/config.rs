use serde::Deserialize;
use std::path::Path;

/// Top-level configuration loaded from crucible.toml.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CrucibleConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the WebSocket service.
    pub host: String,
    pub port: u16,
    /// Hard cap on concurrently tracked sessions.
    pub max_sessions: usize,
    /// Wall-clock limit applied to an execution when the request omits one.
    pub default_timeout_secs: u64,
    /// Silence interval after which a heartbeat notification is emitted.
    pub heartbeat_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL during group teardown.
    pub terminate_grace_secs: u64,
    /// A single output line longer than this is flushed as truncated chunks.
    pub max_line_bytes: usize,
    /// Command allow-list; empty means every command is permitted.
    pub allowed_commands: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Deadline for a freshly launched server to accept a connection.
    pub startup_deadline_secs: u64,
    /// Pause between connection probes while the server boots.
    pub poll_interval_ms: u64,
    /// Per-probe connect timeout.
    pub connect_timeout_ms: u64,
    /// Idle limit on a single notification receive.
    pub recv_timeout_secs: u64,
    /// Kill any server on the port and launch a fresh one before each task.
    pub restart_per_task: bool,
    /// Shell command that launches the server; None uses the current binary.
    pub server_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Extra patterns appended to the built-in tables, one list per tag.
    pub token_limit_patterns: Vec<String>,
    pub rate_limit_patterns: Vec<String>,
    pub auth_failure_patterns: Vec<String>,
    pub service_unavailable_patterns: Vec<String>,
    pub generic_error_patterns: Vec<String>,
    /// Token budget reported in token-limit notifications.
    pub token_limit: u64,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8003,
            max_sessions: 100,
            default_timeout_secs: 600,
            heartbeat_interval_secs: 30,
            terminate_grace_secs: 2,
            max_line_bytes: 8 * 1024 * 1024,
            allowed_commands: Vec::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8004,
            startup_deadline_secs: 10,
            poll_interval_ms: 200,
            connect_timeout_ms: 500,
            recv_timeout_secs: 5,
            restart_per_task: true,
            server_command: None,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            token_limit_patterns: Vec::new(),
            rate_limit_patterns: Vec::new(),
            auth_failure_patterns: Vec::new(),
            service_unavailable_patterns: Vec::new(),
            generic_error_patterns: Vec::new(),
            token_limit: 190_000,
        }
    }
}

/// Errors produced while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read { path: String, source: std::io::Error },
    Parse { path: String, source: toml::de::Error },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {path}: {source}")
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {path}: {source}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl CrucibleConfig {
    /// Load from a TOML file; a missing file yields the built-in defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = CrucibleConfig::default();
        assert_eq!(cfg.server.port, 8003);
        assert_eq!(cfg.server.max_sessions, 100);
        assert_eq!(cfg.server.heartbeat_interval_secs, 30);
        assert_eq!(cfg.server.terminate_grace_secs, 2);
        assert_eq!(cfg.client.port, 8004);
        assert_eq!(cfg.client.startup_deadline_secs, 10);
        assert!(cfg.client.restart_per_task);
        assert!(cfg.server.allowed_commands.is_empty());
        assert_eq!(cfg.classifier.token_limit, 190_000);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = CrucibleConfig::load(Path::new("/nonexistent/crucible.toml")).unwrap();
        assert_eq!(cfg.server.port, 8003);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[server]\nport = 9100\nmax_sessions = 4").unwrap();
        writeln!(f, "[client]\nrestart_per_task = false").unwrap();
        let cfg = CrucibleConfig::load(f.path()).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.max_sessions, 4);
        // untouched sections keep their defaults
        assert_eq!(cfg.server.heartbeat_interval_secs, 30);
        assert!(!cfg.client.restart_per_task);
        assert_eq!(cfg.client.recv_timeout_secs, 5);
    }

    #[test]
    fn test_classifier_section() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "[classifier]\nrate_limit_patterns = [\"quota exhausted\"]\ntoken_limit = 64000"
        )
        .unwrap();
        let cfg = CrucibleConfig::load(f.path()).unwrap();
        assert_eq!(cfg.classifier.rate_limit_patterns, vec!["quota exhausted"]);
        assert_eq!(cfg.classifier.token_limit, 64000);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[server\nport = oops").unwrap();
        let err = CrucibleConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}

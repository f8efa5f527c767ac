use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, fs, path::PathBuf, time::Duration};
use thiserror::Error;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format} configuration: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },
    #[error("Unsupported configuration format. Use 'yaml', 'json' or 'toml'.")]
    UnsupportedFormat,
    #[error("Invalid {var} value '{value}': {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("Invalid server port. Must be greater than 0.")]
    InvalidPort,
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Log line encoding.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// What admission control does when the counter store cannot be reached.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Allow the request and log a warning.
    #[default]
    Open,
    /// Reject the request as if the quota were spent.
    Closed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_credentials: false,
            max_age_seconds: 600,
        }
    }
}

/// Listener, request limits and identity headers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Upper bound for one chat request: admission, history load and the
    /// whole streaming call.
    pub request_timeout_seconds: u64,
    /// Interval between SSE keep-alive comments on idle chat streams.
    pub sse_keep_alive_seconds: u64,
    pub request_id_header: String,
    pub user_id_header: String,
    pub tenant_id_header: String,
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            request_timeout_seconds: 120,
            sse_keep_alive_seconds: 15,
            request_id_header: "x-request-id".to_string(),
            user_id_header: "x-user-id".to_string(),
            tenant_id_header: "x-tenant-id".to_string(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Durable store connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL. When absent the server keeps conversations in memory.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// History window and fast-tier expiry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    /// Number of most recent messages handed to the backend.
    pub window: usize,
    pub ttl_seconds: u64,
    pub repopulate_timeout_seconds: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            window: 20,
            ttl_seconds: 86_400,
            repopulate_timeout_seconds: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TenantConfig {
    pub tier: String,
    /// Group memberships inside the tenant, keyed by user id.
    pub groups: BTreeMap<String, Vec<String>>,
}

/// Daily quota plans and tenant assignments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QuotaConfig {
    /// When false the no-op admission controller is installed.
    pub enabled: bool,
    pub failure_policy: FailurePolicy,
    /// Daily message limit per plan tier; `0` means unlimited.
    pub tiers: BTreeMap<String, i64>,
    /// Lowest tier, applied when the tenant is unknown.
    pub default_tier: String,
    pub tenants: BTreeMap<String, TenantConfig>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let tiers = BTreeMap::from([
            ("free".to_string(), 20),
            ("pro".to_string(), 200),
            ("enterprise".to_string(), 0),
        ]);
        Self {
            enabled: true,
            failure_policy: FailurePolicy::Open,
            tiers,
            default_tier: "free".to_string(),
            tenants: BTreeMap::new(),
        }
    }
}

impl QuotaConfig {
    /// Daily limit of the lowest tier.
    #[must_use]
    pub fn default_limit(&self) -> i64 {
        self.tiers.get(&self.default_tier).copied().unwrap_or(0)
    }
}

/// Generation backend endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub connect_timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090/v1/answer/stream".to_string(),
            connect_timeout_seconds: 10,
        }
    }
}

/// Background task budgets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TaskConfig {
    /// Bound for each background durable write.
    pub persist_timeout_seconds: u64,
    /// How long shutdown waits for background work to drain.
    pub shutdown_grace_seconds: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            persist_timeout_seconds: 5,
            shutdown_grace_seconds: 10,
        }
    }
}

/// The main configuration structure for the `ChatGate` server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub history: HistoryConfig,
    pub quota: QuotaConfig,
    pub backend: BackendConfig,
    pub tasks: TaskConfig,
}

impl Config {
    /// Generates a default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// Environment variables only fill values the file left at their default,
    /// and `port_override` beats both.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when the file cannot be read or parsed, an
    /// environment value is malformed, or the result fails validation.
    pub fn load_config(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::with_defaults(),
        };

        config.apply_env_overrides()?;

        if let Some(port) = port_override {
            config.server.port = port;
        }

        if config.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => {
                serde_yml::from_str(&content).map_err(|err| ConfigError::Parse {
                    format: "yaml",
                    message: err.to_string(),
                })
            }
            Some("json") => serde_json::from_str(&content).map_err(|err| ConfigError::Parse {
                format: "json",
                message: err.to_string(),
            }),
            Some("toml") => toml::from_str(&content).map_err(|err| ConfigError::Parse {
                format: "toml",
                message: err.to_string(),
            }),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let defaults = Self::with_defaults();

        if self.server.port == defaults.server.port {
            if let Ok(port) = env::var("CHATGATE_SERVER_PORT") {
                self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                    var: "CHATGATE_SERVER_PORT",
                    value: port.clone(),
                    reason: "must be a valid number between 1 and 65535",
                })?;
            }
        }
        if self.database.url.is_none() {
            if let Ok(url) = env::var("CHATGATE_DATABASE_URL") {
                self.database.url = Some(url).filter(|value| !value.trim().is_empty());
            }
        }
        if self.logging.level == defaults.logging.level {
            if let Ok(level) = env::var("CHATGATE_LOG_LEVEL") {
                self.logging.level = level;
            }
        }
        if self.logging.format == defaults.logging.format {
            if let Ok(format) = env::var("CHATGATE_LOG_FORMAT") {
                self.logging.format = match format.to_ascii_lowercase().as_str() {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => {
                        return Err(ConfigError::InvalidEnv {
                            var: "CHATGATE_LOG_FORMAT",
                            value: format,
                            reason: "expected 'text' or 'json'",
                        });
                    }
                };
            }
        }
        if self.backend.url == defaults.backend.url {
            if let Ok(url) = env::var("CHATGATE_BACKEND_URL") {
                self.backend.url = url;
            }
        }

        Ok(())
    }

    /// Validate cross-field constraints, collecting every problem found.
    ///
    /// # Errors
    /// Returns the list of human-readable problems when any check fails.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Invalid server port. Must be greater than 0.".to_string());
        }
        if self.server.request_timeout_seconds == 0 {
            errors.push("server.request_timeout_seconds must be greater than 0".to_string());
        }
        if self.server.sse_keep_alive_seconds == 0 {
            errors.push("server.sse_keep_alive_seconds must be greater than 0".to_string());
        }
        if self.history.window == 0 {
            errors.push("history.window must be greater than 0".to_string());
        }
        if self.backend.url.trim().is_empty() {
            errors.push("backend.url must not be empty".to_string());
        }
        if !self.quota.tiers.contains_key(&self.quota.default_tier) {
            errors.push(format!(
                "quota.default_tier '{}' is not a defined tier",
                self.quota.default_tier
            ));
        }
        for (tenant, tenant_config) in &self.quota.tenants {
            if !self.quota.tiers.contains_key(&tenant_config.tier) {
                errors.push(format!(
                    "tenant '{tenant}' references unknown tier '{}'",
                    tenant_config.tier
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Deadline for one chat request.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }

    /// Fast-tier expiry, restarted on every write.
    #[must_use]
    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history.ttl_seconds)
    }

    #[must_use]
    pub fn repopulate_timeout(&self) -> Duration {
        Duration::from_secs(self.history.repopulate_timeout_seconds)
    }

    #[must_use]
    pub fn persist_timeout(&self) -> Duration {
        Duration::from_secs(self.tasks.persist_timeout_seconds)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.tasks.shutdown_grace_seconds)
    }
}

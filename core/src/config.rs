use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub sources: Vec<SourceConfig>,
    pub sync: SyncConfig,
    pub transform: TransformConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Full connection string. When empty, the discrete fields below are used.
    pub url: String,
    pub host: Option<String>,
    pub port: u16,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: Option<String>,
    pub application_name: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub tenant: String,
    pub auth_token: String,
    pub auth_scheme: AuthScheme,
    pub request_timeout_secs: u64,
    /// Client-side pacing of page requests; 0 disables it.
    pub requests_per_second: u32,
    pub updated_filter_param: String,
    /// chrono format applied to the watermark date.
    pub updated_filter_format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Basic,
    Bearer,
}

impl AuthScheme {
    pub fn header_value(&self, token: &str) -> String {
        match self {
            AuthScheme::Basic => format!("Basic {}", token),
            AuthScheme::Bearer => format!("Bearer {}", token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Endpoint path segment, e.g. `club-membership`.
    pub name: String,
    /// Envelope key holding the page's items, e.g. `clubMemberships`.
    pub response_key: String,
    #[serde(default = "default_identity_field")]
    pub identity_field: String,
    #[serde(default)]
    pub pagination: PaginationStyle,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_identity_field() -> String {
    "id".to_string()
}

impl SourceConfig {
    pub fn new(name: &str, response_key: &str) -> Self {
        Self {
            name: name.to_string(),
            response_key: response_key.to_string(),
            identity_field: default_identity_field(),
            pagination: PaginationStyle::Cursor,
            base_url: None,
        }
    }

    /// Logical table name: the endpoint with dashes folded to underscores.
    pub fn table_name(&self) -> String {
        self.name.replace('-', "_")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationStyle {
    /// Opaque continuation token echoed back by the server.
    #[default]
    Cursor,
    /// 1-based page numbers; an empty page ends the walk.
    Page,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub table_prefix: String,
    pub watermark_table: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransformConfig {
    pub enabled: bool,
    pub command: String,
    pub steps: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        // Load default configuration
        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        // Layer on config file if it exists
        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        // Layer on environment variables: SYNC_<SECTION>__<KEY>
        builder = builder.add_source(
            Environment::with_prefix("SYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // Well-known deployment variables win over everything else
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        builder = builder
            .set_override_option("database.url", env("DATABASE_URL"))?
            .set_override_option("database.host", env("DB_HOST"))?
            .set_override_option("database.name", env("DB_NAME"))?
            .set_override_option("database.user", env("DB_USER"))?
            .set_override_option("database.password", env("DB_PASSWORD"))?
            .set_override_option("api.auth_token", env("C7_AUTH_TOKEN"))?
            .set_override_option("api.tenant", env("C7_TENANT"))?;
        if let Some(port) = env("DB_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| ConfigError::Message(format!("DB_PORT is not a valid port: {}", port)))?;
            builder = builder.set_override("database.port", i64::from(port))?;
        }

        let config = builder.build()?;
        let settings: Config = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.connection_url().is_none() {
            return Err(ConfigError::Message(
                "no database configured: set DATABASE_URL or DB_HOST, DB_NAME, DB_USER and DB_PASSWORD".into(),
            ));
        }

        let mut missing = Vec::new();
        if self.api.auth_token.is_empty() {
            missing.push("C7_AUTH_TOKEN");
        }
        if self.api.tenant.is_empty() {
            missing.push("C7_TENANT");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Message(format!(
                "missing required credentials: {}",
                missing.join(", ")
            )));
        }

        if self.sync.batch_size == 0 {
            return Err(ConfigError::Message(
                "sync.batch_size must be greater than 0".into(),
            ));
        }

        if self.sync.max_retries == 0 {
            return Err(ConfigError::Message(
                "sync.max_retries must be greater than 0".into(),
            ));
        }

        if self.sources.is_empty() {
            return Err(ConfigError::Message("at least one source is required".into()));
        }

        let prefix_ok = self.sync.table_prefix.is_empty() || is_safe_identifier(&self.sync.table_prefix);
        if !prefix_ok || !is_safe_identifier(&self.sync.watermark_table) {
            return Err(ConfigError::Message(
                "sync.table_prefix and sync.watermark_table must be valid SQL identifiers".into(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let table = source.table_name();
            if !is_safe_identifier(&table) {
                return Err(ConfigError::Message(format!(
                    "source '{}' does not map to a valid table name",
                    source.name
                )));
            }
            if source.response_key.is_empty() || source.identity_field.is_empty() {
                return Err(ConfigError::Message(format!(
                    "source '{}' needs a response_key and an identity_field",
                    source.name
                )));
            }
            if !seen.insert(table) {
                return Err(ConfigError::Message(format!(
                    "source '{}' is configured more than once",
                    source.name
                )));
            }
        }

        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.name == name || s.table_name() == name)
    }
}

impl DatabaseConfig {
    pub fn connection_url(&self) -> Option<String> {
        if !self.url.is_empty() {
            return Some(self.url.clone());
        }

        let (host, name, user, password) = (
            self.host.as_deref()?,
            self.name.as_deref()?,
            self.user.as_deref()?,
            self.password.as_deref()?,
        );

        let mut url = format!(
            "postgresql://{}:{}@{}:{}/{}",
            user, password, host, self.port, name
        );
        if let Some(ssl_mode) = &self.ssl_mode {
            url.push_str("?sslmode=");
            url.push_str(ssl_mode);
        }
        Some(url)
    }
}

/// Lowercase ASCII letters, digits and underscores, not starting with a digit.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: String::new(),
                host: None,
                port: 5432,
                name: None,
                user: None,
                password: None,
                ssl_mode: None,
                application_name: "warehouse_sync".to_string(),
                max_connections: 5,
                min_connections: 1,
                connect_timeout_secs: 30,
                idle_timeout_secs: 3600,
            },
            api: ApiConfig {
                base_url: "https://api.commerce7.com/v1".to_string(),
                tenant: String::new(),
                auth_token: String::new(),
                auth_scheme: AuthScheme::Basic,
                request_timeout_secs: 60,
                requests_per_second: 0,
                updated_filter_param: "updatedAt".to_string(),
                updated_filter_format: "gte: %Y-%m-%d".to_string(),
            },
            sources: vec![
                SourceConfig::new("customer", "customers"),
                SourceConfig::new("club-membership", "clubMemberships"),
                SourceConfig::new("product", "products"),
                SourceConfig::new("order", "orders"),
            ],
            sync: SyncConfig {
                batch_size: 1000,
                max_retries: 3,
                retry_base_delay_ms: 2000,
                table_prefix: "raw_".to_string(),
                watermark_table: "sync_watermarks".to_string(),
            },
            transform: TransformConfig {
                enabled: true,
                command: "dbt".to_string(),
                steps: vec!["run".to_string()],
                working_dir: None,
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
                metrics_enabled: false,
                metrics_port: 9090,
            },
        }
    }
}

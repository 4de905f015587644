//! Target configuration
//!
//! Settings come from one or more JSON files (later files win) and are then overridden by
//! `TARGET_CLICKHOUSE_<KEY>` environment variables.

use crate::engine::EngineSelector;
use crate::error::{Result, TargetError};
use crate::version::VersionCutoff;
use crate::writer::DEFAULT_MAX_BATCH_ROWS;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

pub const ENV_PREFIX: &str = "TARGET_CLICKHOUSE_";

/// Keys whose environment values are parsed as JSON scalars instead of taken as strings
const NON_STRING_KEYS: [&str; 7] = [
    "port",
    "secure",
    "verify",
    "optimize_after",
    "hard_delete",
    "batch_size_rows",
    "add_record_metadata",
];

/// Wire protocol named in the connection URL
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[default]
    Http,
    Native,
    #[serde(alias = "async")]
    Asynch,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Http => "http",
            Driver::Native => "native",
            Driver::Asynch => "asynch",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| TargetError::Configuration(format!("Unsupported driver '{}'", s)))
    }

    fn default_port(&self) -> u16 {
        match self {
            Driver::Http => 8123,
            Driver::Native | Driver::Asynch => 9000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Full connection URL; overrides the discrete connection settings when set
    pub sqlalchemy_url: Option<String>,
    pub driver: Driver,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub secure: bool,
    pub verify: bool,

    pub engine_type: Option<String>,
    /// Destination table name; defaults to the stream name
    pub table_name: Option<String>,
    /// Replication path template for replicated engines, `{table_name}` is substituted
    pub table_path: Option<String>,
    pub replica_name: Option<String>,
    pub cluster_name: Option<String>,
    /// Accepted for compatibility. Databases are the schema equivalent, so it has no effect.
    pub default_target_schema: Option<String>,

    /// Run `OPTIMIZE TABLE .. FINAL` after every flush
    pub optimize_after: bool,
    /// Hard-delete superseded versions on ACTIVATE_VERSION instead of stamping `_sdc_deleted_at`
    pub hard_delete: bool,
    pub hard_delete_cutoff: VersionCutoff,
    pub soft_delete_cutoff: VersionCutoff,
    pub batch_size_rows: usize,
    pub add_record_metadata: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            sqlalchemy_url: None,
            driver: Driver::Http,
            username: "default".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 8123,
            database: "default".to_string(),
            secure: false,
            verify: true,
            engine_type: None,
            table_name: None,
            table_path: None,
            replica_name: None,
            cluster_name: None,
            default_target_schema: None,
            optimize_after: false,
            hard_delete: true,
            hard_delete_cutoff: VersionCutoff::Inclusive,
            soft_delete_cutoff: VersionCutoff::Exclusive,
            batch_size_rows: DEFAULT_MAX_BATCH_ROWS,
            add_record_metadata: false,
        }
    }
}

impl TargetConfig {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| TargetError::Configuration(format!("Invalid configuration: {}", e)))
    }

    /// Load and merge config files, then apply environment overrides
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut merged = Map::new();
        for path in paths {
            let path = path.as_ref();
            let contents = std::fs::read_to_string(path)?;
            let value: Value = serde_json::from_str(&contents)?;
            match value {
                Value::Object(object) => merged.extend(object),
                _ => {
                    return Err(TargetError::Configuration(format!(
                        "Config file {} is not a JSON object",
                        path.display()
                    )))
                }
            }
            debug!(path = %path.display(), "Loaded config file");
        }

        apply_env_overrides(&mut merged, std::env::vars());
        Self::from_value(Value::Object(merged))
    }

    /// Fail fast on settings that would only surface once DDL is issued
    pub fn validate(&self) -> Result<()> {
        self.engine_selector()?;

        if self.batch_size_rows == 0 {
            return Err(TargetError::Configuration(
                "batch_size_rows must be at least 1".to_string(),
            ));
        }

        self.connection_settings()?;

        if self.hard_delete_cutoff != self.soft_delete_cutoff {
            warn!(
                hard_delete = %self.hard_delete_cutoff,
                soft_delete = %self.soft_delete_cutoff,
                "Hard and soft delete use different version cutoffs"
            );
        }
        Ok(())
    }

    pub fn engine_selector(&self) -> Result<EngineSelector> {
        EngineSelector::new(
            self.engine_type.as_deref(),
            self.table_path.as_deref(),
            self.replica_name.as_deref(),
        )
    }

    /// Discrete connection settings, parsed back out of `sqlalchemy_url` when it is set
    pub fn connection_settings(&self) -> Result<ConnectionSettings> {
        match &self.sqlalchemy_url {
            Some(url) if !url.trim().is_empty() => ConnectionSettings::from_url(url),
            _ => Ok(ConnectionSettings {
                driver: self.driver,
                username: self.username.clone(),
                password: self.password.clone(),
                host: self.host.clone(),
                port: self.port,
                database: self.database.clone(),
                secure: self.secure,
                verify: self.verify,
            }),
        }
    }

    /// Driver connection URL: the explicit URL if configured, otherwise built from the parts
    pub fn connection_url(&self) -> Result<String> {
        match &self.sqlalchemy_url {
            Some(url) if !url.trim().is_empty() => Ok(url.clone()),
            _ => Ok(self.connection_settings()?.to_url()),
        }
    }

    /// Setting names with their defaults, for `--about`
    pub fn about() -> Value {
        let defaults = serde_json::to_value(TargetConfig::default()).unwrap_or(Value::Null);
        serde_json::json!({
            "name": "target-clickhouse",
            "env_prefix": ENV_PREFIX,
            "engines": crate::engine::EngineFamily::ALL
                .iter()
                .map(|e| e.as_str())
                .collect::<Vec<_>>(),
            "settings": defaults,
        })
    }
}

fn apply_env_overrides(
    config: &mut Map<String, Value>,
    vars: impl Iterator<Item = (String, String)>,
) {
    for (name, raw) in vars {
        let Some(key) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let key = key.to_lowercase();
        let value = if NON_STRING_KEYS.contains(&key.as_str()) {
            serde_json::from_str(&raw.to_lowercase()).unwrap_or(Value::String(raw))
        } else {
            Value::String(raw)
        };
        debug!(key = %key, "Config overridden from environment");
        config.insert(key, value);
    }
}

/// Resolved connection parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub driver: Driver,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub secure: bool,
    pub verify: bool,
}

impl ConnectionSettings {
    /// Parse `clickhouse+<driver>://user:pass@host:port/db?protocol=https&verify=false`
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| TargetError::Configuration(format!("Invalid connection URL: {}", e)))?;

        let driver = match parsed.scheme().split_once('+') {
            Some(("clickhouse", driver)) => Driver::parse(driver)?,
            None if parsed.scheme() == "clickhouse" => Driver::Http,
            _ => {
                return Err(TargetError::Configuration(format!(
                    "Unsupported connection URL scheme '{}'",
                    parsed.scheme()
                )))
            }
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| TargetError::Configuration("Connection URL has no host".to_string()))?
            .to_string();

        let decode = |s: &str| -> Result<String> {
            urlencoding::decode(s)
                .map(|decoded| decoded.into_owned())
                .map_err(|e| TargetError::Configuration(format!("Invalid URL encoding: {}", e)))
        };

        let database = parsed.path().trim_start_matches('/');
        let mut settings = Self {
            driver,
            username: if parsed.username().is_empty() {
                "default".to_string()
            } else {
                decode(parsed.username())?
            },
            password: decode(parsed.password().unwrap_or(""))?,
            host,
            port: parsed.port().unwrap_or_else(|| driver.default_port()),
            database: if database.is_empty() { "default".to_string() } else { decode(database)? },
            secure: false,
            verify: true,
        };

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "protocol" => settings.secure = value.eq_ignore_ascii_case("https"),
                "secure" => settings.secure = parse_flag(&value)?,
                "verify" => settings.verify = parse_flag(&value)?,
                _ => {}
            }
        }
        Ok(settings)
    }

    pub fn to_url(&self) -> String {
        let options = match self.driver {
            Driver::Http if self.secure => format!("protocol=https&verify={}", self.verify),
            Driver::Http => "protocol=http".to_string(),
            Driver::Native | Driver::Asynch => {
                format!("secure={}&verify={}", self.secure, self.verify)
            }
        };
        format!(
            "clickhouse+{}://{}:{}@{}:{}/{}?{}",
            self.driver.as_str(),
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            self.database,
            options
        )
    }

    /// Base URL of the HTTP interface
    pub fn http_endpoint(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}/", scheme, self.host, self.port)
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(TargetError::Configuration(format!(
            "Invalid boolean '{}' in connection URL",
            other
        ))),
    }
}

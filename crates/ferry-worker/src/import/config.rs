//! Import job payloads
//!
//! An import job receives its [`ImportConfig`] and its credentials as two
//! separate JSON payloads. They are never merged, so credentials never travel
//! inside a config that might be logged or persisted.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::mysql::MySqlConnectOptions;

use ferry_common::types::{decode_payload, NamedEntity};

use crate::error::{WorkerError, WorkerResult};

/// Default MySQL port
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Default search cluster port
pub const DEFAULT_ELASTIC_PORT: u16 = 9200;

fn default_true() -> bool {
    true
}

/// Description of a single import run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Base URL of the receiving API
    pub api_url: String,
    pub event_source: NamedEntity,
    pub event_type: String,
    #[serde(default)]
    pub module: String,
    /// Importer-specific settings, validated by the importer
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub transitional: bool,
}

impl ImportConfig {
    /// Decode and validate a caller-supplied payload
    pub fn from_payload(payload: Value) -> WorkerResult<Self> {
        let config: Self = decode_payload(payload)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(WorkerError::Configuration(format!(
                "import '{}' has api_url '{}' without an http(s) scheme",
                self.name, self.api_url
            )));
        }
        if !is_path_segment(&self.event_type) {
            return Err(WorkerError::Configuration(format!(
                "import '{}' has invalid event_type '{}'",
                self.name, self.event_type
            )));
        }
        self.event_source.validate()?;
        if !is_path_segment(&self.event_source.id) {
            return Err(WorkerError::Configuration(format!(
                "import '{}' has event_source id '{}' that cannot be used in a URL path",
                self.name, self.event_source.id
            )));
        }
        Ok(())
    }

    /// Path on the receiving API that collects this import's batches
    pub fn webhook_path(&self) -> String {
        format!("/collect/{}/{}", self.event_type, self.event_source.id)
    }

    /// Decode the importer-specific `config` section
    pub fn importer_config<T: DeserializeOwned>(&self) -> WorkerResult<T> {
        decode_payload(Value::Object(self.config.clone())).map_err(|e| {
            WorkerError::Configuration(format!("import '{}' config: {}", self.name, e))
        })
    }
}

/// Both parts of the webhook path are used verbatim
fn is_path_segment(value: &str) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|c| matches!(c, '/' | '?' | '#' | '%') || c.is_whitespace() || c.is_control())
}

// ============================================================================
// Credentials
// ============================================================================

/// MySQL connection parameters
#[derive(Clone, Serialize, Deserialize)]
pub struct MySqlCredentials {
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
}

fn default_mysql_port() -> u16 {
    DEFAULT_MYSQL_PORT
}

impl MySqlCredentials {
    pub fn from_payload(payload: Value) -> WorkerResult<Self> {
        Ok(decode_payload(payload)?)
    }

    /// Connection options for `database`, consuming the credentials
    pub fn into_connect_options(self, database: &str) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(database);

        match self.password {
            Some(ref password) => options.password(password),
            None => options,
        }
    }
}

impl std::fmt::Debug for MySqlCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlCredentials")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

/// Search cluster connection parameters
#[derive(Clone, Serialize, Deserialize)]
pub struct ElasticCredentials {
    /// Host name, or a full base URL
    pub url: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_elastic_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_elastic_port() -> u16 {
    DEFAULT_ELASTIC_PORT
}

impl ElasticCredentials {
    pub fn from_payload(payload: Value) -> WorkerResult<Self> {
        Ok(decode_payload(payload)?)
    }

    /// Base URL of the cluster without a trailing slash
    pub fn endpoint(&self) -> String {
        if self.url.contains("://") {
            self.url.trim_end_matches('/').to_string()
        } else {
            format!("{}://{}:{}", self.scheme, self.url.trim_end_matches('/'), self.port)
        }
    }
}

impl std::fmt::Debug for ElasticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticCredentials")
            .field("endpoint", &self.endpoint())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

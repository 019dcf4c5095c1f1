//! Suite configuration
//!
//! Values resolve in this order: a non-empty environment variable, then the
//! value from the suite file, then the built-in default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AccordResult;
use crate::registry::ApplicationInfo;

/// An environment variable name plus the value to use when it is unset
#[derive(Debug, Clone, Copy)]
pub struct EnvVariable {
    pub name: &'static str,
    pub default: &'static str,
}

impl EnvVariable {
    pub const fn new(name: &'static str, default: &'static str) -> Self {
        Self { name, default }
    }

    /// Value of the variable, or the default if unset or empty
    pub fn value(&self) -> String {
        lookup(self.name).unwrap_or_else(|| self.default.to_string())
    }
}

fn lookup(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn override_string(target: &mut String, name: &str) {
    if let Some(value) = lookup(name) {
        *target = value;
    }
}

pub const AWS_ENVIRONMENT: EnvVariable = EnvVariable::new("AWS_ENVIRONMENT", "local");
pub const SQS_ENDPOINT_URL: EnvVariable =
    EnvVariable::new("AWS_SQS_ENDPOINT_URL", "http://localhost:9324");
pub const SQS_ENDPOINT_REGION: EnvVariable =
    EnvVariable::new("AWS_SQS_ENDPOINT_REGION", "elasticmq");
pub const SQS_ENDPOINT_REPLACE_URL: EnvVariable =
    EnvVariable::new("AWS_SQS_ENDPOINT_REPLACE_URL", "http://voila-elasticmq:9324");
pub const S3_ENDPOINT_URL: EnvVariable =
    EnvVariable::new("AWS_S3_ENDPOINT_URL", "http://localhost:8001");
pub const S3_ENDPOINT_REGION: EnvVariable = EnvVariable::new("AWS_S3_ENDPOINT_REGION", "s3mock");
pub const S3_ENDPOINT_REPLACE_URL: EnvVariable =
    EnvVariable::new("AWS_S3_ENDPOINT_REPLACE_URL", "http://voila-s3mock:8001");
pub const MAILBOX_HOST: EnvVariable = EnvVariable::new("MAILBOX_HOST", "127.0.0.1");
pub const MAILBOX_POP3_PORT: EnvVariable = EnvVariable::new("MAILBOX_POP3_PORT", "3110");

/// Complete suite configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Services under test
    pub applications: Vec<ApplicationInfo>,

    /// Message queue endpoint
    pub queue: EndpointConfig,

    /// Object storage endpoint
    pub storage: EndpointConfig,

    /// POP3 mailbox server
    pub mailbox: MailboxConfig,

    /// Logical SQL databases
    pub databases: Vec<DatabaseConfig>,

    /// Runner behaviour
    pub runner: RunnerSettings,
}

/// Connection settings for an AWS-compatible endpoint (queue or object store)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub enabled: bool,

    /// URL API calls are sent to
    pub endpoint_url: String,

    pub region: String,

    /// Suffix appended to queue and bucket names
    pub environment: String,

    /// Host prefix the service reports that is not resolvable from here,
    /// e.g. a container hostname. Rewritten to `endpoint_url`.
    pub replace_url: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint_url: String::new(),
            region: String::new(),
            environment: String::new(),
            replace_url: None,
        }
    }
}

impl EndpointConfig {
    fn fill(&mut self, url: EnvVariable, region: EnvVariable, replace: EnvVariable) {
        if self.endpoint_url.is_empty() {
            self.endpoint_url = url.default.to_string();
        }
        if self.region.is_empty() {
            self.region = region.default.to_string();
        }
        if self.environment.is_empty() {
            self.environment = AWS_ENVIRONMENT.default.to_string();
        }
        if self.replace_url.is_none() {
            self.replace_url = Some(replace.default.to_string());
        }

        override_string(&mut self.endpoint_url, url.name);
        override_string(&mut self.region, region.name);
        override_string(&mut self.environment, AWS_ENVIRONMENT.name);
        if let Some(value) = lookup(replace.name) {
            self.replace_url = Some(value);
        }
    }

    /// Rewrites the unreachable host prefix in `url` to the configured endpoint
    pub fn rewrite_url(&self, url: &str) -> String {
        match &self.replace_url {
            Some(internal) if !internal.is_empty() => url.replace(internal, &self.endpoint_url),
            _ => url.to_string(),
        }
    }
}

/// POP3 mailbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: MAILBOX_HOST.default.to_string(),
            port: 3110,
            timeout_ms: 5000,
        }
    }
}

impl MailboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A logical SQL database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Identifier steps refer to
    pub id: String,

    /// SQLite file path
    pub path: PathBuf,

    #[serde(default = "default_db_retries")]
    pub retries: u32,

    #[serde(default = "default_db_retry_pause_ms")]
    pub retry_pause_ms: u64,

    /// Tables cleared before all others during truncation
    #[serde(default)]
    pub key_tables: Vec<String>,
}

fn default_db_retries() -> u32 {
    10
}

fn default_db_retry_pause_ms() -> u64 {
    1000
}

impl DatabaseConfig {
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    fn env_name(&self) -> String {
        format!("ACCORD_DB_{}_PATH", self.id.to_uppercase().replace('-', "_"))
    }
}

/// Runner behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub features_dir: PathBuf,
    pub output_dir: PathBuf,

    /// Base directory for files referenced by steps
    pub resources_dir: PathBuf,

    pub readiness_timeout_secs: u64,
    pub probe_interval_ms: u64,

    /// Upper bound on table rows executing at once
    pub row_concurrency: usize,

    pub request_timeout_secs: u64,

    /// Send PATCH as POST with an override header
    pub force_method_override: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            features_dir: PathBuf::from("features"),
            output_dir: PathBuf::from("test-results"),
            resources_dir: PathBuf::from("resources"),
            readiness_timeout_secs: 180,
            probe_interval_ms: 1000,
            row_concurrency: 16,
            request_timeout_secs: 30,
            force_method_override: false,
        }
    }
}

impl RunnerSettings {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SuiteConfig {
    /// Load configuration from a TOML file, falling back to defaults if absent
    pub fn load(path: &Path) -> AccordResult<Self> {
        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_environment();
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> AccordResult<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.apply_environment();
        Ok(config)
    }

    /// Fill unset endpoint values and apply environment overrides
    pub fn apply_environment(&mut self) {
        self.queue
            .fill(SQS_ENDPOINT_URL, SQS_ENDPOINT_REGION, SQS_ENDPOINT_REPLACE_URL);
        self.storage
            .fill(S3_ENDPOINT_URL, S3_ENDPOINT_REGION, S3_ENDPOINT_REPLACE_URL);

        override_string(&mut self.mailbox.host, MAILBOX_HOST.name);
        if let Some(port) = lookup(MAILBOX_POP3_PORT.name).and_then(|p| p.parse().ok()) {
            self.mailbox.port = port;
        }

        for db in &mut self.databases {
            if let Some(path) = lookup(&db.env_name()) {
                db.path = PathBuf::from(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suite() {
        let toml = r#"
[[applications]]
url_prefix = "orders"
host = "localhost"
http_port = 8080
admin_port = 8081
admin_health_check_url = "/health"

[queue]
enabled = true
environment = "ci"

[[databases]]
id = "orders"
path = "/tmp/orders.db"
key_tables = ["order_line"]

[runner]
row_concurrency = 4
"#;
        let config = SuiteConfig::from_toml(toml).unwrap();
        assert_eq!(config.applications.len(), 1);
        assert_eq!(config.applications[0].http_port, 8080);
        assert!(config.queue.enabled);
        assert!(!config.storage.enabled);
        assert_eq!(config.databases[0].retries, 10);
        assert_eq!(config.runner.row_concurrency, 4);
        assert_eq!(config.runner.readiness_timeout_secs, 180);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = SuiteConfig::load(Path::new("/nonexistent/accord.toml")).unwrap();
        assert!(config.applications.is_empty());
        assert!(!config.storage.endpoint_url.is_empty());
    }

    #[test]
    fn test_rewrite_url() {
        let endpoint = EndpointConfig {
            enabled: true,
            endpoint_url: "http://localhost:8001".into(),
            region: "s3mock".into(),
            environment: "local".into(),
            replace_url: Some("http://voila-s3mock:8001".into()),
        };
        assert_eq!(
            endpoint.rewrite_url("http://voila-s3mock:8001/bucket/key?sig=1"),
            "http://localhost:8001/bucket/key?sig=1"
        );
        assert_eq!(
            endpoint.rewrite_url("http://elsewhere/x"),
            "http://elsewhere/x"
        );
    }
}

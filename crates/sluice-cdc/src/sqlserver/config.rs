//! SQL Server connector configuration
//!
//! # Security Note
//!
//! [`SqlServerConnectorConfig`] implements a custom Debug that redacts the
//! password so it never reaches the logs.
//!
//! # Example
//!
//! ```rust
//! use sluice_cdc::sqlserver::SqlServerConnectorConfig;
//!
//! let config = SqlServerConnectorConfig::builder()
//!     .topic_prefix("srv1")
//!     .host("localhost")
//!     .username("sa")
//!     .password("YourPassword123!")
//!     .database("inventory")
//!     .poll_interval_ms(500)
//!     .build()
//!     .unwrap();
//!
//! assert!(config.connector.supports_operation_filtering);
//! ```

use super::query::DataQueryMode;
use crate::common::{CdcError, ConnectorConfig, ConnectorConfigBuilder, Operation, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SQL Server specific settings on top of [`ConnectorConfig`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlServerConnectorConfig {
    #[serde(flatten)]
    pub connector: ConnectorConfig,
    pub host: String,
    /// Default: 1433
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Captured databases, one partition each
    pub database_names: Vec<String>,
    /// Application name for connection identification
    pub application_name: String,
    /// Wait between polls that found nothing new (default: 500ms)
    pub poll_interval_ms: u64,
    /// Transactions read per poll (0 = everything up to the current maximum)
    pub max_transactions_per_iteration: u32,
    pub data_query_mode: DataQueryMode,
    pub connect_timeout_secs: u64,
    /// Trust self-signed server certificates
    pub trust_server_certificate: bool,
    pub encrypt: bool,
}

impl std::fmt::Debug for SqlServerConnectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerConnectorConfig")
            .field("connector", &self.connector)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database_names", &self.database_names)
            .field("application_name", &self.application_name)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field(
                "max_transactions_per_iteration",
                &self.max_transactions_per_iteration,
            )
            .field("data_query_mode", &self.data_query_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("encrypt", &self.encrypt)
            .finish()
    }
}

impl Default for SqlServerConnectorConfig {
    fn default() -> Self {
        Self {
            connector: ConnectorConfig {
                supports_operation_filtering: true,
                ..Default::default()
            },
            host: "localhost".to_string(),
            port: 1433,
            username: String::new(),
            password: None,
            database_names: Vec::new(),
            application_name: "sluice-cdc".to_string(),
            poll_interval_ms: 500,
            max_transactions_per_iteration: 0,
            data_query_mode: DataQueryMode::Function,
            connect_timeout_secs: 30,
            trust_server_certificate: false,
            encrypt: true,
        }
    }
}

impl SqlServerConnectorConfig {
    pub fn builder() -> SqlServerConnectorConfigBuilder {
        SqlServerConnectorConfigBuilder::default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Logical server name, used as the `server` partition field.
    pub fn server_name(&self) -> &str {
        &self.connector.topic_prefix
    }

    pub fn validate(&self) -> Result<()> {
        self.connector.validate()?;
        if self.host.is_empty() {
            return Err(CdcError::config("Host is required"));
        }
        if self.database_names.is_empty() {
            return Err(CdcError::config("At least one database is required"));
        }
        if self.database_names.iter().any(|d| d.trim().is_empty()) {
            return Err(CdcError::config("Database names must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(CdcError::config("Poll interval must be > 0"));
        }
        if self.poll_interval_ms < 50 {
            return Err(CdcError::config(
                "Poll interval must be >= 50ms to avoid excessive load",
            ));
        }
        Ok(())
    }

    /// ADO.NET style connection string for one database.
    pub fn connection_string(&self, database: &str) -> String {
        let mut parts = vec![
            format!("Server={},{}", self.host, self.port),
            format!("Database={}", database),
            format!("User Id={}", self.username),
        ];
        if let Some(ref pwd) = self.password {
            parts.push(format!("Password={}", pwd));
        }
        parts.push(format!("Application Name={}", self.application_name));
        let timeout_secs = i32::try_from(self.connect_timeout_secs).unwrap_or(i32::MAX);
        parts.push(format!("Connect Timeout={}", timeout_secs));
        if self.trust_server_certificate {
            parts.push("TrustServerCertificate=true".to_string());
        }
        parts.push(format!("Encrypt={}", self.encrypt));
        parts.join(";")
    }

    /// Connection string with the password masked, for logging.
    pub fn redacted_connection_string(&self, database: &str) -> String {
        let conn_str = self.connection_string(database);
        match conn_str.find("Password=") {
            Some(start) => match conn_str[start..].find(';') {
                Some(end) => format!(
                    "{}Password=[REDACTED]{}",
                    &conn_str[..start],
                    &conn_str[start + end..]
                ),
                None => format!("{}Password=[REDACTED]", &conn_str[..start]),
            },
            None => conn_str,
        }
    }
}

/// Builder for SqlServerConnectorConfig
#[derive(Default)]
pub struct SqlServerConnectorConfigBuilder {
    connector: ConnectorConfigBuilder,
    config: SqlServerConnectorConfig,
}

impl SqlServerConnectorConfigBuilder {
    /// Logical server name and topic prefix
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.connector = self.connector.topic_prefix(prefix);
        self
    }

    /// Operations left out of the stream, filtered by the change query
    pub fn skipped_operations(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.connector = self.connector.skipped_operations(ops);
        self
    }

    /// Adjust any other pipeline setting.
    pub fn connector(mut self, f: impl FnOnce(ConnectorConfigBuilder) -> ConnectorConfigBuilder) -> Self {
        self.connector = f(self.connector);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Add a captured database
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database_names.push(database.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Set the poll interval in milliseconds (default: 500ms)
    ///
    /// Lower values = lower latency but higher database load.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Bound each poll to this many transactions (0 = unbounded)
    pub fn max_transactions_per_iteration(mut self, n: u32) -> Self {
        self.config.max_transactions_per_iteration = n;
        self
    }

    pub fn data_query_mode(mut self, mode: DataQueryMode) -> Self {
        self.config.data_query_mode = mode;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    /// Trust server certificate (for self-signed certs)
    ///
    /// **Security warning**: Only use in development/testing.
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.config.trust_server_certificate = trust;
        self
    }

    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.config.encrypt = encrypt;
        self
    }

    pub fn build(self) -> Result<SqlServerConnectorConfig> {
        let mut config = self.config;
        config.connector = self.connector.supports_operation_filtering(true).build()?;
        config.validate()?;
        Ok(config)
    }
}

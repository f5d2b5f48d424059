//! pgkeeper Configuration
//!
//! This module provides configuration structures for the keeper. Only the
//! local instance settings live here; cluster-wide policy comes from the
//! cluster data snapshot.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Authentication methods accepted for the superuser and replication roles
pub const SUPPORTED_AUTH_METHODS: &[&str] = &["md5", "scram-sha-256", "password", "trust"];

/// Main keeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Keeper-specific configuration
    pub keeper: KeeperSection,

    /// Local PostgreSQL instance configuration
    pub postgres: PostgresConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Keeper-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperSection {
    /// Unique keeper identifier, matched against `DbSpec::keeper_uid`
    pub uid: String,

    /// Data directory holding the PostgreSQL data and generated files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Local PostgreSQL instance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Address PostgreSQL listens on and advertises to peers
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// PostgreSQL port
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Superuser name
    #[serde(default = "default_su_username")]
    pub su_username: String,

    /// Superuser authentication method
    #[serde(default = "default_auth_method")]
    pub su_auth_method: String,

    /// Superuser password (not needed with `trust`)
    #[serde(default)]
    pub su_password: Option<String>,

    /// Replication user name
    #[serde(default = "default_repl_username")]
    pub repl_username: String,

    /// Replication authentication method
    #[serde(default = "default_auth_method")]
    pub repl_auth_method: String,

    /// Replication password (not needed with `trust`)
    #[serde(default)]
    pub repl_password: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/pgkeeper")
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_su_username() -> String {
    "postgres".to_string()
}

fn default_repl_username() -> String {
    "repluser".to_string()
}

fn default_auth_method() -> String {
    "md5".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl LoggingConfig {
    /// Apply command line settings on top of the configured ones
    pub fn with_overrides(mut self, level: Option<String>, format: Option<String>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(format) = format {
            self.format = format;
        }
        self
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl KeeperConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: KeeperConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.keeper.uid.is_empty() {
            return Err(crate::Error::Config("keeper.uid cannot be empty".into()));
        }

        let pg = &self.postgres;
        if pg.su_username.is_empty() {
            return Err(crate::Error::Config("postgres.su_username cannot be empty".into()));
        }
        if pg.repl_username.is_empty() {
            return Err(crate::Error::Config("postgres.repl_username cannot be empty".into()));
        }

        check_auth("su", &pg.su_auth_method, pg.su_password.as_deref())?;
        check_auth("repl", &pg.repl_auth_method, pg.repl_password.as_deref())?;

        // One role cannot carry two methods or two passwords
        if pg.su_username == pg.repl_username {
            if pg.su_auth_method != pg.repl_auth_method {
                return Err(crate::Error::Config(
                    "superuser and replication user are the same but their auth methods differ".into(),
                ));
            }
            if pg.su_password != pg.repl_password {
                return Err(crate::Error::Config(
                    "superuser and replication user are the same but their passwords differ".into(),
                ));
            }
        }

        Ok(())
    }

    /// Path of the generated pg_hba.conf
    pub fn hba_path(&self) -> PathBuf {
        self.keeper.data_dir.join("postgres").join("pg_hba.conf")
    }
}

fn check_auth(role: &str, method: &str, password: Option<&str>) -> crate::Result<()> {
    if !SUPPORTED_AUTH_METHODS.contains(&method) {
        return Err(crate::Error::Config(format!(
            "postgres.{}_auth_method {:?} is not one of {}",
            role,
            method,
            SUPPORTED_AUTH_METHODS.join(", ")
        )));
    }
    if method != "trust" && password.map_or(true, str::is_empty) {
        return Err(crate::Error::Config(format!(
            "postgres.{}_password is required with auth method {}",
            role, method
        )));
    }
    Ok(())
}

//! Server configuration from the environment.

use std::path::PathBuf;

/// How long tombstones are kept by default; clients offline longer than
/// this must do a full sync
pub const DEFAULT_TOMBSTONE_RETENTION_DAYS: i64 = 90;

/// Backend server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SQLite database file path
    pub database_path: PathBuf,
    /// Listen port
    pub port: u16,
    /// Days a tombstone survives before the maintenance task prunes it
    pub tombstone_retention_days: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("tidemark.db"),
            port: 3000,
            tombstone_retention_days: DEFAULT_TOMBSTONE_RETENTION_DAYS,
        }
    }
}

impl ServerConfig {
    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("TIDEMARK_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            port: std::env::var("TIDEMARK_PORT")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.port),
            tombstone_retention_days: std::env::var("TIDEMARK_TOMBSTONE_RETENTION_DAYS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.tombstone_retention_days),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(
            config.tombstone_retention_days,
            DEFAULT_TOMBSTONE_RETENTION_DAYS
        );
    }
}

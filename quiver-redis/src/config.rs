//! Store configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{StoreError, StoreResult};

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (redis://host:port or rediss://host:port for TLS).
    pub url: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// Minimum idle connections.
    pub min_idle: Option<u32>,
    /// Connection timeout.
    #[serde(with = "duration_secs", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    /// Database number (0-15).
    pub database: Option<u8>,
    /// Username for Redis 6+ ACL.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 16,
            min_idle: Some(1),
            connection_timeout: default_connection_timeout(),
            database: None,
            username: None,
            password: None,
        }
    }
}

impl RedisConfig {
    /// Create a new configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }

    /// Load configuration from `QUIVER_REDIS_*` environment variables.
    pub fn from_env() -> RedisConfigBuilder {
        let mut builder = RedisConfigBuilder::new();

        if let Ok(url) = std::env::var("QUIVER_REDIS_URL") {
            builder = builder.url(url);
        }

        if let Ok(pool_size) = std::env::var("QUIVER_REDIS_POOL_SIZE")
            && let Ok(size) = pool_size.parse()
        {
            builder = builder.pool_size(size);
        }

        if let Ok(db) = std::env::var("QUIVER_REDIS_DATABASE")
            && let Ok(db_num) = db.parse()
        {
            builder = builder.database(db_num);
        }

        if let Ok(username) = std::env::var("QUIVER_REDIS_USERNAME") {
            builder = builder.username(username);
        }

        if let Ok(password) = std::env::var("QUIVER_REDIS_PASSWORD") {
            builder = builder.password(password);
        }

        builder
    }

    /// Check that the URL parses and the pool can hold at least one
    /// connection. Watch sessions borrow a dedicated connection, so a pool
    /// of one would starve script calls while a session is open.
    pub fn validate(&self) -> StoreResult<()> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| StoreError::Config(format!("invalid url '{}': {}", self.url, e)))?;

        if !matches!(parsed.scheme(), "redis" | "rediss") {
            return Err(StoreError::Config(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        if self.pool_size < 2 {
            return Err(StoreError::Config("pool_size must be at least 2".into()));
        }
        if let Some(db) = self.database
            && db > 15
        {
            return Err(StoreError::Config(format!("database {} out of range", db)));
        }
        Ok(())
    }

    /// Get the full Redis URL with auth and database.
    pub fn connection_url(&self) -> String {
        let mut url = self.url.clone();

        if let Some(password) = &self.password {
            let auth = match &self.username {
                Some(username) => format!("{}:{}@", username, password),
                None => format!(":{}@", password),
            };
            for scheme in ["redis://", "rediss://"] {
                if url.starts_with(scheme) {
                    url = url.replacen(scheme, &format!("{}{}", scheme, auth), 1);
                    break;
                }
            }
        }

        if let Some(db) = self.database {
            url = format!("{}/{}", url.trim_end_matches('/'), db);
        }

        url
    }
}

/// Builder for Redis configuration.
#[derive(Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RedisConfig::default(),
        }
    }

    /// Set the Redis URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the pool size.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the minimum idle connections.
    pub fn min_idle(mut self, min_idle: u32) -> Self {
        self.config.min_idle = Some(min_idle);
        self
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the database number.
    pub fn database(mut self, db: u8) -> Self {
        self.config.database = Some(db);
        self
    }

    /// Set the username (Redis 6+ ACL).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RedisConfig {
        self.config
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url_with_password() {
        let config = RedisConfig::builder()
            .url("redis://localhost:6379")
            .password("secret")
            .build();
        assert_eq!(config.connection_url(), "redis://:secret@localhost:6379");
    }

    #[test]
    fn test_connection_url_with_acl_and_database() {
        let config = RedisConfig::builder()
            .url("rediss://cache:6380")
            .username("app")
            .password("pw")
            .database(3)
            .build();
        assert_eq!(config.connection_url(), "rediss://app:pw@cache:6380/3");
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let config = RedisConfig::new("http://localhost:6379");
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_tiny_pool() {
        let config = RedisConfig::builder().pool_size(1).build();
        assert!(config.validate().is_err());
        assert!(RedisConfig::default().validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RedisConfig = serde_json::from_str(
            r#"{"url":"redis://db:6379","pool_size":4,"min_idle":null,
                "database":null,"username":null,"password":null}"#,
        )
        .unwrap();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
    }
}

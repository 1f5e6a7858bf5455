//! Server configuration parsed from environment variables.

use crate::services::pipeline::PipelineConfig;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_EDIT_WORKERS: usize = 4;
pub const DEFAULT_EDIT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} required")]
    Missing { var: &'static str },
    #[error("invalid {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Tuning for the edit pipeline and per-connection buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub outbound_buffer: usize,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_EDIT_WORKERS,
            queue_capacity: DEFAULT_EDIT_QUEUE_CAPACITY,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl EditConfig {
    #[must_use]
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig { workers: self.workers, capacity: self.queue_capacity }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub edit: EditConfig,
}

impl ServerConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `EDIT_WORKERS`: consumer workers, default 4
    /// - `EDIT_QUEUE_CAPACITY`: slots per worker queue, default 1024
    /// - `OUTBOUND_BUFFER`: notices buffered per connection, default 256
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is missing or a value is not a number.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing { var: "DATABASE_URL" })?;
        let edit = EditConfig {
            workers: parse_or(&lookup, "EDIT_WORKERS", DEFAULT_EDIT_WORKERS)?.max(1),
            queue_capacity: parse_or(&lookup, "EDIT_QUEUE_CAPACITY", DEFAULT_EDIT_QUEUE_CAPACITY)?.max(1),
            outbound_buffer: parse_or(&lookup, "OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?.max(1),
        };

        Ok(Self {
            database_url,
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            edit,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

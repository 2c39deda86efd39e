//! Global application configuration manager.
//!
//! `AppConfig` is a lazily initialized, globally accessible singleton containing
//! runtime configuration values loaded from environment variables. It provides
//! thread-safe access and mutation for testing or overrides in runtime environments.

use std::env;
use std::str::FromStr;
use std::sync::{OnceLock, RwLock};

/// Represents the complete application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub project_name: String,
    pub log_level: String,
    pub log_file: String,
    pub log_to_stdout: bool,
    pub database_path: String,
    /// Seconds between two proximity samples while a student is being polled.
    pub geo_poll_interval_secs: u64,
    /// Upper bound for a single student location sample.
    pub geo_sample_timeout_ms: u64,
    /// Upper bound for the lecturer's one-shot reference point acquisition.
    pub geo_acquire_timeout_ms: u64,
    /// Delay before the code capture channel is reopened after a mismatch.
    pub code_retry_delay_ms: u64,
}

/// Lazily-initialized, thread-safe singleton instance of `AppConfig`.
static CONFIG_INSTANCE: OnceLock<RwLock<AppConfig>> = OnceLock::new();

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Loads the configuration from `.env` and environment variables.
    ///
    /// Missing or malformed values fall back to their defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            env: env::var("APP_ENV").unwrap_or_else(|_| "development".into()),
            project_name: env::var("PROJECT_NAME").unwrap_or_else(|_| "geoattend".into()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "services=info,db=info".into()),
            log_file: env::var("LOG_FILE").unwrap_or_else(|_| "geoattend.log".into()),
            log_to_stdout: env::var("LOG_TO_STDOUT").unwrap_or_else(|_| "false".into()) == "true",
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/geoattend.db".into()),
            geo_poll_interval_secs: parse_or("GEO_POLL_INTERVAL_SECS", 15),
            geo_sample_timeout_ms: parse_or("GEO_SAMPLE_TIMEOUT_MS", 10_000),
            geo_acquire_timeout_ms: parse_or("GEO_ACQUIRE_TIMEOUT_MS", 20_000),
            code_retry_delay_ms: parse_or("CODE_RETRY_DELAY_MS", 2_000),
        }
    }

    /// Returns a shared reference to the global configuration.
    ///
    /// # Panics
    /// Panics if the lock cannot be acquired.
    pub fn global() -> std::sync::RwLockReadGuard<'static, AppConfig> {
        CONFIG_INSTANCE
            .get_or_init(|| RwLock::new(AppConfig::from_env()))
            .read()
            .expect("Failed to acquire AppConfig read lock")
    }

    /// Resets the configuration by reloading from environment variables.
    ///
    /// Useful in tests to clear overrides.
    pub fn reset() {
        if let Some(lock) = CONFIG_INSTANCE.get() {
            let mut guard = lock.write().expect("Failed to acquire AppConfig write lock");
            *guard = AppConfig::from_env();
        }
    }

    /// Generic internal setter for any field in the config.
    fn set_field<F>(setter: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let lock = CONFIG_INSTANCE.get_or_init(|| RwLock::new(AppConfig::from_env()));
        let mut guard = lock
            .write()
            .expect("Failed to acquire AppConfig write lock");
        setter(&mut guard);
    }

    // --- Per-field setters below ---

    pub fn set_env(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.env = value.into());
    }

    pub fn set_log_level(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.log_level = value.into());
    }

    pub fn set_log_file(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.log_file = value.into());
    }

    pub fn set_log_to_stdout(value: bool) {
        AppConfig::set_field(|cfg| cfg.log_to_stdout = value);
    }

    pub fn set_database_path(value: impl Into<String>) {
        AppConfig::set_field(|cfg| cfg.database_path = value.into());
    }

    pub fn set_geo_poll_interval_secs(value: u64) {
        AppConfig::set_field(|cfg| cfg.geo_poll_interval_secs = value);
    }

    pub fn set_geo_sample_timeout_ms(value: u64) {
        AppConfig::set_field(|cfg| cfg.geo_sample_timeout_ms = value);
    }

    pub fn set_geo_acquire_timeout_ms(value: u64) {
        AppConfig::set_field(|cfg| cfg.geo_acquire_timeout_ms = value);
    }

    pub fn set_code_retry_delay_ms(value: u64) {
        AppConfig::set_field(|cfg| cfg.code_retry_delay_ms = value);
    }
}

// --- Free accessors ---

pub fn env() -> String {
    AppConfig::global().env.clone()
}

pub fn project_name() -> String {
    AppConfig::global().project_name.clone()
}

pub fn log_level() -> String {
    AppConfig::global().log_level.clone()
}

pub fn log_file() -> String {
    AppConfig::global().log_file.clone()
}

pub fn log_to_stdout() -> bool {
    AppConfig::global().log_to_stdout
}

pub fn database_path() -> String {
    AppConfig::global().database_path.clone()
}

pub fn geo_poll_interval_secs() -> u64 {
    AppConfig::global().geo_poll_interval_secs
}

pub fn geo_sample_timeout_ms() -> u64 {
    AppConfig::global().geo_sample_timeout_ms
}

pub fn geo_acquire_timeout_ms() -> u64 {
    AppConfig::global().geo_acquire_timeout_ms
}

pub fn code_retry_delay_ms() -> u64 {
    AppConfig::global().code_retry_delay_ms
}

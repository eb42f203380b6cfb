use crate::error::{Error, Result};
use crate::services::dispatcher::DispatcherSettings;
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub public_rps: u32,
    pub webhook_max_attempts: u32,
    pub webhook_timeout_ms: u64,
    pub webhook_backoff_base_ms: u64,
    pub webhook_disable_threshold: i32,
    pub webhook_max_concurrency: usize,
    pub webhook_outbox_sweep_secs: u64,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url: get_env("DATABASE_URL")?,
            jwt_secret: get_env("JWT_SECRET")?,
            public_rps: get_env_parse_or("PUBLIC_RPS", 60)?,
            webhook_max_attempts: get_env_parse_or("WEBHOOK_MAX_ATTEMPTS", 3)?,
            webhook_timeout_ms: get_env_parse_or("WEBHOOK_TIMEOUT_MS", 10_000)?,
            webhook_backoff_base_ms: get_env_parse_or("WEBHOOK_BACKOFF_BASE_MS", 1_000)?,
            webhook_disable_threshold: get_env_parse_or("WEBHOOK_DISABLE_THRESHOLD", 10)?,
            webhook_max_concurrency: get_env_parse_or("WEBHOOK_MAX_CONCURRENCY", 32)?,
            webhook_outbox_sweep_secs: get_env_parse_or("WEBHOOK_OUTBOX_SWEEP_SECS", 30)?,
        })
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            max_attempts: self.webhook_max_attempts.max(1),
            timeout: Duration::from_millis(self.webhook_timeout_ms),
            backoff_base: Duration::from_millis(self.webhook_backoff_base_ms),
            disable_threshold: self.webhook_disable_threshold,
            max_concurrency: self.webhook_max_concurrency.max(1),
            ..DispatcherSettings::default()
        }
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        _ => Ok(default),
    }
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}

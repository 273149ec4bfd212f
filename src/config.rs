use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

use crate::constants::{
    BATTLE_CANCEL_RETRY_MS, BATTLE_EXPIRY_SECS, BATTLE_ROUND_DELAY_MS, DAILY_CASE_COOLDOWN_HOURS,
    MAX_BATTLE_PLAYERS, MAX_OPEN_COUNT, SEED_POOL_BATCH_SIZE, SEED_POOL_MIN_SIZE,
    SEED_POOL_RETRY_SECS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RandomnessSource {
    RandomOrg,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub environment: String,

    // Storage
    pub storage_backend: StorageBackend,
    pub database_url: String,
    pub database_max_connections: u32,

    // JWT
    pub jwt_secret: String,

    // Randomness
    pub randomness_source: RandomnessSource,
    pub random_org_api_key: Option<String>,
    pub random_org_url: String,
    pub seed_pool_min_size: usize,
    pub seed_pool_batch_size: usize,
    pub seed_pool_retry_secs: u64,

    // Case opening
    pub max_open_count: u32,
    pub daily_case_cooldown_hours: i64,
    pub daily_case_min_deposit: Decimal,
    pub influencer_override_enabled: bool,

    // Battles
    pub max_battle_players: u32,
    pub battle_round_delay_ms: u64,
    pub battle_expiry_secs: u64,
    pub battle_cancel_retry_ms: u64,

    // CORS
    pub cors_allowed_origins: String,

    // Only honour X-Forwarded-For when a reverse proxy rewrites it
    pub trust_proxy_headers: bool,
}

// Internal helper that parses an optional env var with a default.
fn env_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

// Internal helper that checks conditions for `env_flag`.
fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| {
            let normalized = v.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
        })
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let storage_backend = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StorageBackend::Memory,
            "postgres" => StorageBackend::Postgres,
            other => anyhow::bail!("Unknown STORAGE_BACKEND: {}", other),
        };
        let randomness_source = match env::var("RANDOMNESS_SOURCE")
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "random_org" | "randomorg" => RandomnessSource::RandomOrg,
            "local" => RandomnessSource::Local,
            other => anyhow::bail!("Unknown RANDOMNESS_SOURCE: {}", other),
        };

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 3000)?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),

            storage_backend,
            database_url: env::var("DATABASE_URL").unwrap_or_default(),
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 20)?,

            jwt_secret: env::var("JWT_SECRET")?,

            randomness_source,
            random_org_api_key: env::var("RANDOM_ORG_API_KEY").ok(),
            random_org_url: env::var("RANDOM_ORG_URL")
                .unwrap_or_else(|_| "https://api.random.org/json-rpc/4/invoke".to_string()),
            seed_pool_min_size: env_or("SEED_POOL_MIN_SIZE", SEED_POOL_MIN_SIZE)?,
            seed_pool_batch_size: env_or("SEED_POOL_BATCH_SIZE", SEED_POOL_BATCH_SIZE)?,
            seed_pool_retry_secs: env_or("SEED_POOL_RETRY_SECS", SEED_POOL_RETRY_SECS)?,

            max_open_count: env_or("MAX_OPEN_COUNT", MAX_OPEN_COUNT)?,
            daily_case_cooldown_hours: env_or(
                "DAILY_CASE_COOLDOWN_HOURS",
                DAILY_CASE_COOLDOWN_HOURS,
            )?,
            daily_case_min_deposit: env_or("DAILY_CASE_MIN_DEPOSIT", Decimal::new(5, 0))?,
            influencer_override_enabled: env_flag("INFLUENCER_OVERRIDE_ENABLED", true),

            max_battle_players: env_or("MAX_BATTLE_PLAYERS", MAX_BATTLE_PLAYERS)?,
            battle_round_delay_ms: env_or("BATTLE_ROUND_DELAY_MS", BATTLE_ROUND_DELAY_MS)?,
            battle_expiry_secs: env_or("BATTLE_EXPIRY_SECS", BATTLE_EXPIRY_SECS)?,
            battle_cancel_retry_ms: env_or("BATTLE_CANCEL_RETRY_MS", BATTLE_CANCEL_RETRY_MS)?,

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string()),
            trust_proxy_headers: env_flag("TRUST_PROXY_HEADERS", false),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage_backend == StorageBackend::Postgres && self.database_url.trim().is_empty()
        {
            anyhow::bail!("DATABASE_URL is empty");
        }
        if self.jwt_secret.trim().is_empty() {
            anyhow::bail!("JWT_SECRET is empty");
        }
        if self.randomness_source == RandomnessSource::RandomOrg
            && self
                .random_org_api_key
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            anyhow::bail!("RANDOM_ORG_API_KEY is required for RANDOMNESS_SOURCE=random_org");
        }
        if self.seed_pool_batch_size == 0 {
            anyhow::bail!("SEED_POOL_BATCH_SIZE must be > 0");
        }
        if self.max_battle_players < 2 {
            anyhow::bail!("MAX_BATTLE_PLAYERS must be at least 2");
        }
        if self.daily_case_cooldown_hours <= 0 {
            anyhow::bail!("DAILY_CASE_COOLDOWN_HOURS must be > 0");
        }
        if self.max_open_count == 0 {
            anyhow::bail!("MAX_OPEN_COUNT must be > 0");
        }

        if self.randomness_source == RandomnessSource::Local && !self.is_development() {
            tracing::warn!("Using local entropy for server seeds outside development");
        }
        if self.storage_backend == StorageBackend::Memory && !self.is_development() {
            tracing::warn!("In-memory storage selected; state is lost on restart");
        }
        if self.jwt_secret.contains("super_secret") {
            tracing::warn!("Detected dev credentials in config");
        }
        if self.cors_allowed_origins.trim().is_empty() {
            tracing::warn!("CORS_ALLOWED_ORIGINS is empty; requests may be blocked");
        }

        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development" || self.environment == "test"
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 3000,
        environment: "test".to_string(),
        storage_backend: StorageBackend::Memory,
        database_url: String::new(),
        database_max_connections: 1,
        jwt_secret: "test_secret".to_string(),
        randomness_source: RandomnessSource::Local,
        random_org_api_key: None,
        random_org_url: "http://localhost:0".to_string(),
        seed_pool_min_size: 4,
        seed_pool_batch_size: 8,
        seed_pool_retry_secs: 0,
        max_open_count: MAX_OPEN_COUNT,
        daily_case_cooldown_hours: DAILY_CASE_COOLDOWN_HOURS,
        daily_case_min_deposit: Decimal::new(5, 0),
        influencer_override_enabled: true,
        max_battle_players: MAX_BATTLE_PLAYERS,
        battle_round_delay_ms: 0,
        battle_expiry_secs: BATTLE_EXPIRY_SECS,
        battle_cancel_retry_ms: 5,
        cors_allowed_origins: "*".to_string(),
        trust_proxy_headers: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_test_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn validate_requires_random_org_key() {
        let mut config = test_config();
        config.randomness_source = RandomnessSource::RandomOrg;
        assert!(config.validate().is_err());
        config.random_org_api_key = Some("key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_database_url_for_postgres() {
        let mut config = test_config();
        config.storage_backend = StorageBackend::Postgres;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_single_player_battles() {
        let mut config = test_config();
        config.max_battle_players = 1;
        assert!(config.validate().is_err());
    }
}

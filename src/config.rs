use std::env::var;
use std::str::FromStr;

use dotenvy::dotenv;
use thiserror::Error;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub seed_sample_messages: bool,
}

impl Config {
    pub fn try_parse() -> Result<Config, ConfigError> {
        let _ = dotenv();

        Ok(Config {
            database_url: var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            max_connections: parse_or_default("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            seed_sample_messages: parse_or_default("SEED_SAMPLE_MESSAGES", true)?,
        })
    }
}

fn parse_or_default<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

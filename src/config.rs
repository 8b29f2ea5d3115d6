use std::{env, net::SocketAddr, str::FromStr};
use thiserror::Error;

use crate::aggregate::FlagPolicy;
use crate::models::Identity;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid environment variable format for {0}: {1}")]
    InvalidVar(String, String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    /// DynamoDB tables plus an S3 bucket.
    Aws,
    /// Everything in process memory; nothing survives a restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(StorageBackend::Aws),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown backend '{}', expected 'aws' or 'memory'", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub backend: StorageBackend,
    pub meme_bucket_name: String,
    pub aws_region: String,
    // Optional endpoint for LocalStack
    pub localstack_endpoint: Option<String>,
    pub table_prefix: String,
    pub image_base_url: String,
    pub max_upload_bytes: usize,
    pub flag_policy: FlagPolicy,
    /// `token:user_id:username` triples, comma separated. Memory backend only.
    pub seed_sessions: Vec<(String, Identity)>,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignores errors, relies on env vars otherwise)
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `load` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_address_str = lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let bind_address = SocketAddr::from_str(&bind_address_str)
            .map_err(|e| ConfigError::InvalidVar("BIND_ADDRESS".into(), e.to_string()))?;

        let backend = parse_or("STORAGE_BACKEND", &lookup, StorageBackend::Aws)?;

        let meme_bucket_name = match (lookup("MEME_BUCKET_NAME"), backend) {
            (Some(name), _) => name,
            (None, StorageBackend::Memory) => String::new(),
            (None, StorageBackend::Aws) => return Err(ConfigError::MissingVar("MEME_BUCKET_NAME".into())),
        };

        let aws_region = lookup("AWS_DEFAULT_REGION").unwrap_or_else(|| "ca-central-1".to_string());
        let localstack_endpoint = lookup("AWS_ENDPOINT_URL").filter(|s| !s.is_empty());
        let table_prefix = lookup("TABLE_PREFIX").unwrap_or_default();
        let image_base_url = lookup("IMAGE_BASE_URL").unwrap_or_else(|| "/images".to_string());
        let max_upload_bytes = parse_or("MAX_UPLOAD_BYTES", &lookup, 5 * 1024 * 1024)?;

        let threshold: u64 = parse_or("FLAG_THRESHOLD", &lookup, 1)?;
        if threshold == 0 {
            return Err(ConfigError::InvalidVar("FLAG_THRESHOLD".into(), "must be at least 1".into()));
        }
        let once_per_user = parse_or("FLAG_ONCE_PER_USER", &lookup, false)?;

        let seed_sessions = match lookup("SEED_SESSIONS") {
            Some(raw) => parse_sessions(&raw)?,
            None => Vec::new(),
        };

        Ok(Config {
            bind_address,
            backend,
            meme_bucket_name,
            aws_region,
            localstack_endpoint,
            table_prefix,
            image_base_url,
            max_upload_bytes,
            flag_policy: FlagPolicy {
                threshold,
                once_per_user,
            },
            seed_sessions,
        })
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidVar(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn parse_sessions(raw: &str) -> Result<Vec<(String, Identity)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(token), Some(user_id), Some(username))
                    if !token.is_empty() && !user_id.is_empty() && !username.is_empty() =>
                {
                    Ok((
                        token.to_string(),
                        Identity {
                            user_id: user_id.to_string(),
                            username: username.to_string(),
                        },
                    ))
                }
                _ => Err(ConfigError::InvalidVar(
                    "SEED_SESSIONS".into(),
                    format!("expected token:user_id:username, got '{}'", entry),
                )),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_for_memory_backend() {
        let config = Config::from_lookup(lookup(&[("STORAGE_BACKEND", "memory")])).unwrap();
        assert_eq!(config.backend, StorageBackend::Memory);
        assert_eq!(config.bind_address.port(), 3000);
        assert_eq!(config.max_upload_bytes, 5 * 1024 * 1024);
        assert_eq!(config.flag_policy, FlagPolicy::default());
        assert_eq!(config.image_base_url, "/images");
        assert!(config.seed_sessions.is_empty());
    }

    #[test]
    fn aws_backend_requires_bucket() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(v) if v == "MEME_BUCKET_NAME"));
        let config = Config::from_lookup(lookup(&[("MEME_BUCKET_NAME", "memes")])).unwrap();
        assert_eq!(config.backend, StorageBackend::Aws);
    }

    #[test]
    fn flag_policy_settings() {
        let config = Config::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "memory"),
            ("FLAG_THRESHOLD", "3"),
            ("FLAG_ONCE_PER_USER", "true"),
        ]))
        .unwrap();
        assert_eq!(config.flag_policy.threshold, 3);
        assert!(config.flag_policy.once_per_user);

        let err = Config::from_lookup(lookup(&[("STORAGE_BACKEND", "memory"), ("FLAG_THRESHOLD", "0")]));
        assert!(matches!(err, Err(ConfigError::InvalidVar(..))));
    }

    #[test]
    fn seed_sessions_parse() {
        let config = Config::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "memory"),
            ("SEED_SESSIONS", "t1:u1:alice, t2:u2:bob"),
        ]))
        .unwrap();
        assert_eq!(config.seed_sessions.len(), 2);
        assert_eq!(config.seed_sessions[1].0, "t2");
        assert_eq!(config.seed_sessions[1].1.username, "bob");

        let err = Config::from_lookup(lookup(&[("STORAGE_BACKEND", "memory"), ("SEED_SESSIONS", "broken")]));
        assert!(matches!(err, Err(ConfigError::InvalidVar(..))));
    }

    #[test]
    fn bad_values_are_reported() {
        let err = Config::from_lookup(lookup(&[("STORAGE_BACKEND", "postgres")]));
        assert!(matches!(err, Err(ConfigError::InvalidVar(..))));
        let err = Config::from_lookup(lookup(&[("STORAGE_BACKEND", "memory"), ("BIND_ADDRESS", "nope")]));
        assert!(matches!(err, Err(ConfigError::InvalidVar(..))));
    }
}

use std::{
    env,
    net::{AddrParseError, SocketAddr},
    path::PathBuf,
};

use thiserror::Error;

const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
const MIN_STORE_TIMEOUT_MS: u64 = 100;
const MAX_STORE_TIMEOUT_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub db_url: Option<String>,
    pub store_timeout_ms: u64,
    pub internal_token: Option<String>,
    pub dump_command: String,
    pub dump_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PROFILES_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid PROFILES_STORE_TIMEOUT_MS: {0}")]
    InvalidStoreTimeoutMs(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("PROFILES_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            lookup("PROFILES_SERVICE_NAME").unwrap_or_else(|| "profile-service".to_string());
        let build_sha = lookup("PROFILES_BUILD_SHA").unwrap_or_else(|| "dev".to_string());
        let db_url = non_empty(lookup("DB_URL")).or_else(|| non_empty(lookup("DATABASE_URL")));
        let store_timeout_ms = parse_u64_env_lookup(
            &lookup,
            "PROFILES_STORE_TIMEOUT_MS",
            DEFAULT_STORE_TIMEOUT_MS,
        )
        .map_err(ConfigError::InvalidStoreTimeoutMs)?
        .clamp(MIN_STORE_TIMEOUT_MS, MAX_STORE_TIMEOUT_MS);
        let internal_token = non_empty(lookup("PROFILES_INTERNAL_TOKEN"));
        let dump_command =
            non_empty(lookup("PROFILES_DUMP_COMMAND")).unwrap_or_else(|| "pg_dump".to_string());
        let dump_dir = non_empty(lookup("PROFILES_DUMP_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            db_url,
            store_timeout_ms,
            internal_token,
            dump_command,
            dump_dir,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64_env_lookup<F>(lookup: &F, key: &str, default: u64) -> Result<u64, String>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup(key)) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|error| format!("{key}={raw}: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::{Config, ConfigError};

    fn config_from(values: &HashMap<&str, &str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = config_from(&HashMap::new()).expect("default config");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:4200");
        assert_eq!(config.service_name, "profile-service");
        assert_eq!(config.build_sha, "dev");
        assert!(config.db_url.is_none());
        assert_eq!(config.store_timeout_ms, 5_000);
        assert!(config.internal_token.is_none());
        assert_eq!(config.dump_command, "pg_dump");
    }

    #[test]
    fn env_overrides_are_applied_and_timeout_is_clamped() {
        let values = HashMap::from([
            ("PROFILES_BIND_ADDR", "0.0.0.0:9000"),
            ("DATABASE_URL", "postgres://bot@localhost/profiles"),
            ("PROFILES_STORE_TIMEOUT_MS", "999999"),
            ("PROFILES_INTERNAL_TOKEN", "  secret  "),
            ("PROFILES_DUMP_COMMAND", "/usr/lib/postgresql/16/bin/pg_dump"),
            ("PROFILES_DUMP_DIR", "/var/tmp/profile-dumps"),
        ]);
        let config = config_from(&values).expect("config parse");
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(
            config.db_url.as_deref(),
            Some("postgres://bot@localhost/profiles")
        );
        assert_eq!(config.store_timeout_ms, 60_000);
        assert_eq!(config.internal_token.as_deref(), Some("secret"));
        assert_eq!(config.dump_command, "/usr/lib/postgresql/16/bin/pg_dump");
        assert_eq!(config.dump_dir, PathBuf::from("/var/tmp/profile-dumps"));
    }

    #[test]
    fn db_url_takes_precedence_and_blank_values_are_ignored() {
        let values = HashMap::from([
            ("DB_URL", "   "),
            ("DATABASE_URL", "postgres://fallback/profiles"),
        ]);
        let config = config_from(&values).expect("config parse");
        assert_eq!(config.db_url.as_deref(), Some("postgres://fallback/profiles"));

        let values = HashMap::from([
            ("DB_URL", "postgres://primary/profiles"),
            ("DATABASE_URL", "postgres://fallback/profiles"),
        ]);
        let config = config_from(&values).expect("config parse");
        assert_eq!(config.db_url.as_deref(), Some("postgres://primary/profiles"));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let values = HashMap::from([("PROFILES_STORE_TIMEOUT_MS", "soon")]);
        match config_from(&values) {
            Err(ConfigError::InvalidStoreTimeoutMs(message)) => {
                assert!(message.contains("PROFILES_STORE_TIMEOUT_MS"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let values = HashMap::from([("PROFILES_BIND_ADDR", "not-an-addr")]);
        assert!(matches!(
            config_from(&values),
            Err(ConfigError::BindAddrParse(_))
        ));
    }
}

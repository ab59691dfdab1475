use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use draw_core::{Roster, RosterDefinition, RosterError};

use crate::store::{RetryPolicy, StoreError};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("cannot read roster file {path:?}: {source}")]
    RosterRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse roster file {path:?}: {source}")]
    RosterParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid roster: {0}")]
    Roster(#[from] RosterError),
    #[error("cannot open store: {0}")]
    Store(#[from] StoreError),
}

/// Runtime settings, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub persist_path: Option<PathBuf>,
    pub roster_path: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub draw_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            persist_path: None,
            roster_path: None,
            retry: RetryPolicy::default(),
            draw_seed: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.persist_path = lookup("PERSIST_PATH").map(PathBuf::from);
        config.roster_path = lookup("ROSTER_PATH").map(PathBuf::from);

        if let Some(value) = lookup("TX_MAX_ATTEMPTS") {
            let attempts: u32 = parse("TX_MAX_ATTEMPTS", &value)?;
            if attempts == 0 {
                return Err(ConfigError::Invalid {
                    var: "TX_MAX_ATTEMPTS",
                    value,
                });
            }
            config.retry.max_attempts = attempts;
        }
        if let Some(value) = lookup("TX_BACKOFF_MS") {
            config.retry.backoff = Duration::from_millis(parse("TX_BACKOFF_MS", &value)?);
        }
        if let Some(value) = lookup("DRAW_SEED") {
            config.draw_seed = Some(parse("DRAW_SEED", &value)?);
        }
        Ok(config)
    }

    /// Roster from `ROSTER_PATH`, or the built-in one.
    pub async fn load_roster(&self) -> Result<Roster, ConfigError> {
        let Some(path) = &self.roster_path else {
            return Ok(Roster::default());
        };
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ConfigError::RosterRead {
                path: path.clone(),
                source,
            })?;
        let def: RosterDefinition =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::RosterParse {
                path: path.clone(),
                source,
            })?;
        Ok(Roster::try_from(def)?)
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn reads_every_setting() {
        let config = Config::from_lookup(lookup_from(&[
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("PERSIST_PATH", "/tmp/draw.json"),
            ("ROSTER_PATH", "/tmp/roster.json"),
            ("TX_MAX_ATTEMPTS", "9"),
            ("TX_BACKOFF_MS", "25"),
            ("DRAW_SEED", "42"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.persist_path, Some(PathBuf::from("/tmp/draw.json")));
        assert_eq!(config.roster_path, Some(PathBuf::from("/tmp/roster.json")));
        assert_eq!(
            config.retry,
            RetryPolicy {
                max_attempts: 9,
                backoff: Duration::from_millis(25),
            }
        );
        assert_eq!(config.draw_seed, Some(42));
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = Config::from_lookup(lookup_from(&[("TX_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "TX_MAX_ATTEMPTS", .. }));
        let err = Config::from_lookup(lookup_from(&[("DRAW_SEED", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "DRAW_SEED", .. }));
    }

    #[tokio::test]
    async fn loads_roster_file() {
        let path = std::env::temp_dir().join(format!("roster_{}.json", Uuid::new_v4()));
        tokio::fs::write(
            &path,
            r#"{"names":["Ana","Bia","Caio","Duda"],"forced_pair":["Ana","Bia"]}"#,
        )
        .await
        .unwrap();

        let config = Config {
            roster_path: Some(path.clone()),
            ..Config::default()
        };
        let roster = config.load_roster().await.unwrap();
        assert_eq!(roster.len(), 4);
        assert_eq!(roster.forced_pair(), ("Ana", "Bia"));

        tokio::fs::write(&path, r#"{"names":["Ana","ana"],"forced_pair":["Ana","ana"]}"#)
            .await
            .unwrap();
        let err = config.load_roster().await.unwrap_err();
        assert!(matches!(err, ConfigError::Roster(RosterError::KeyCollision { .. })));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_roster_file_is_an_error() {
        let config = Config {
            roster_path: Some(PathBuf::from("/definitely/not/here.json")),
            ..Config::default()
        };
        assert!(matches!(
            config.load_roster().await,
            Err(ConfigError::RosterRead { .. })
        ));
    }
}

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Download window knobs (see the snapshot projection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotWindows {
    /// Card assignments: include the last N days (today counts as day one).
    pub assignment_days: u32,
    /// Tasks: most recent N by due date.
    pub task_limit: u32,
    /// Labor plans: most recent N by year/month.
    pub labor_plan_limit: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    /// Explicit deployment-level tenant binding for tokens without one.
    /// Unset means such tokens are rejected outright; the old implicit
    /// "tenant 1" fallback is gone.
    pub default_tenant: Option<i64>,
    pub windows: SnapshotWindows,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "CAMPO_API_BIND_ADDR", "127.0.0.1:8080");
        let db_path = PathBuf::from(value_or_default(&lookup, "CAMPO_API_DB_PATH", "campo-api.db"));

        let default_tenant = optional_trimmed(&lookup, "CAMPO_DEFAULT_TENANT")
            .map(|value| {
                value.parse::<i64>().map_err(|_| {
                    ConfigError::Invalid("CAMPO_DEFAULT_TENANT must be an integer".to_string())
                })
            })
            .transpose()?;

        let assignment_days = parse_ranged(&lookup, "CAMPO_ASSIGNMENT_WINDOW_DAYS", 2, 1..=30)?;
        let task_limit = parse_ranged(&lookup, "CAMPO_TASK_WINDOW", 200, 1..=1_000)?;
        let labor_plan_limit = parse_ranged(&lookup, "CAMPO_LABOR_PLAN_WINDOW", 120, 1..=1_000)?;

        Ok(Self {
            bind_addr,
            db_path,
            default_tenant,
            windows: SnapshotWindows {
                assignment_days,
                task_limit,
                labor_plan_limit,
            },
        })
    }
}

#[cfg(test)]
impl AppConfig {
    /// Default configuration for tests, independent of the environment.
    pub fn for_tests() -> Self {
        Self::from_lookup(|_| None).expect("default config is valid")
    }
}

fn parse_ranged(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u32,
    range: std::ops::RangeInclusive<u32>,
) -> Result<u32, ConfigError> {
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<u32>().map_err(|_| {
            ConfigError::Invalid(format!(
                "{name} must be an integer in [{}, {}]",
                range.start(),
                range.end()
            ))
        })?,
        None => default,
    };
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_has_sensible_defaults() {
        let config = from_map(&HashMap::new()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.default_tenant, None);
        assert_eq!(config.windows.assignment_days, 2);
        assert_eq!(config.windows.task_limit, 200);
        assert_eq!(config.windows.labor_plan_limit, 120);
    }

    #[test]
    fn config_rejects_out_of_range_windows() {
        let mut map = HashMap::new();
        map.insert("CAMPO_ASSIGNMENT_WINDOW_DAYS", "0");
        assert!(from_map(&map).is_err());

        let mut map = HashMap::new();
        map.insert("CAMPO_TASK_WINDOW", "100000");
        assert!(from_map(&map).is_err());
    }

    #[test]
    fn config_rejects_non_numeric_default_tenant() {
        let mut map = HashMap::new();
        map.insert("CAMPO_DEFAULT_TENANT", "acme");
        assert!(from_map(&map).is_err());
    }

    #[test]
    fn config_parses_explicit_default_tenant() {
        let mut map = HashMap::new();
        map.insert("CAMPO_DEFAULT_TENANT", "7");
        let config = from_map(&map).unwrap();
        assert_eq!(config.default_tenant, Some(7));
    }
}

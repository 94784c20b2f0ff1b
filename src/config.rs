use std::time::Duration;

use anyhow::Context;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub service_database_url: Option<String>,
    pub sheet_url: Option<String>,
    pub max_connections: u32,
    pub retry: RetryPolicy,
    pub dev_bypass: bool,
}

impl Config {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("ATTENDANCE_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .context("ATTENDANCE_DATABASE_URL (or DATABASE_URL) must be set to the backend Postgres instance")?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_var(&lookup, "ATTENDANCE_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.max_attempts),
            base_delay: parse_var(&lookup, "ATTENDANCE_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: parse_var(&lookup, "ATTENDANCE_RETRY_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            backoff_factor: defaults.backoff_factor,
        };

        let dev_bypass = lookup("ATTENDANCE_DEV_BYPASS")
            .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            service_database_url: lookup("ATTENDANCE_SERVICE_DATABASE_URL"),
            sheet_url: lookup("ATTENDANCE_SHEET_URL"),
            max_connections: parse_var(&lookup, "ATTENDANCE_MAX_CONNECTIONS")?.unwrap_or(5),
            retry,
            dev_bypass,
        })
    }

    /// The privileged connection string. Only the spreadsheet migration uses it.
    pub fn service_database_url(&self) -> anyhow::Result<&str> {
        self.service_database_url
            .as_deref()
            .context("ATTENDANCE_SERVICE_DATABASE_URL must be set for the spreadsheet migration")
    }

    /// The bypass login exists in debug builds only.
    pub fn dev_bypass_allowed(&self) -> bool {
        self.dev_bypass && cfg!(debug_assertions)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("{key} has an invalid value '{value}'"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn database_url_is_required() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("ATTENDANCE_DATABASE_URL"));
    }

    #[test]
    fn falls_back_to_database_url() {
        let config = Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://app@db/ss")]))
            .unwrap();
        assert_eq!(config.database_url, "postgres://app@db/ss");
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(!config.dev_bypass);
    }

    #[test]
    fn reads_retry_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("ATTENDANCE_DATABASE_URL", "postgres://app@db/ss"),
            ("ATTENDANCE_RETRY_ATTEMPTS", "5"),
            ("ATTENDANCE_RETRY_BASE_MS", "250"),
            ("ATTENDANCE_DEV_BYPASS", "true"),
        ]))
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert!(config.dev_bypass);
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = Config::from_lookup(lookup_from(&[
            ("ATTENDANCE_DATABASE_URL", "postgres://app@db/ss"),
            ("ATTENDANCE_MAX_CONNECTIONS", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("ATTENDANCE_MAX_CONNECTIONS"));
    }

    #[test]
    fn service_url_only_when_configured() {
        let config = Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://app@db/ss")]))
            .unwrap();
        assert!(config.service_database_url().is_err());
    }
}

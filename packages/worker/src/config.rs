use std::env;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub poll_interval_ms: u64,
    pub commerce_api_version: String,
    pub commerce_window_days: i64,
    pub ads_attribution_window_days: i64,
    pub commerce_fresh_sched_minutes: i64,
    pub ads_fresh_sched_minutes: i64,
    pub cron_secret: Option<String>,
    pub ads_jobs_enabled: bool,
    pub health_port: u16,
    pub ads_api_base_url: Option<String>,
    pub ipv4_override: Option<Ipv4Addr>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            poll_interval_ms: parse_with_floor("POLL_INTERVAL_MS", 5000, 1000)?,
            commerce_api_version: env::var("COMMERCE_API_VERSION")
                .unwrap_or_else(|_| "2025-01".to_string()),
            commerce_window_days: parse_with_floor("COMMERCE_WINDOW_DAYS", 7, 1)?,
            ads_attribution_window_days: parse_with_floor("ADS_ATTRIBUTION_WINDOW_DAYS", 7, 1)?,
            commerce_fresh_sched_minutes: parse_with_floor("COMMERCE_FRESH_SCHED_MINUTES", 60, 5)?,
            ads_fresh_sched_minutes: parse_with_floor("ADS_FRESH_SCHED_MINUTES", 60, 5)?,
            cron_secret: env::var("CRON_SECRET").ok().filter(|s| !s.is_empty()),
            ads_jobs_enabled: env::var("ADS_JOBS_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            health_port: env::var("HEALTH_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("HEALTH_PORT must be a valid port number")?,
            ads_api_base_url: env::var("ADS_API_BASE_URL").ok().filter(|s| !s.is_empty()),
            ipv4_override: match env::var("IPV4_OVERRIDE") {
                Ok(v) if !v.is_empty() => {
                    Some(v.parse().context("IPV4_OVERRIDE must be an IPv4 address")?)
                }
                _ => None,
            },
        })
    }
}

/// Parse a numeric env var, falling back to `default` and clamping to `floor`.
fn parse_with_floor<T>(key: &str, default: T, floor: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + Copy,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", key))?,
        Err(_) => default,
    };
    Ok(if value < floor { floor } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_is_applied() {
        env::set_var("TEST_FLOOR_KEY", "250");
        let v: u64 = parse_with_floor("TEST_FLOOR_KEY", 5000, 1000).unwrap();
        assert_eq!(v, 1000);
        env::remove_var("TEST_FLOOR_KEY");
    }

    #[test]
    fn default_when_unset() {
        env::remove_var("TEST_DEFAULT_KEY");
        let v: i64 = parse_with_floor("TEST_DEFAULT_KEY", 60, 5).unwrap();
        assert_eq!(v, 60);
    }

    #[test]
    fn invalid_number_is_an_error() {
        env::set_var("TEST_BAD_KEY", "sixty");
        let v: Result<i64> = parse_with_floor("TEST_BAD_KEY", 60, 5);
        assert!(v.is_err());
        env::remove_var("TEST_BAD_KEY");
    }
}

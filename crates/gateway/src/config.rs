//! Process configuration.
//!
//! Read once from the environment at startup and injected by value; nothing
//! here is mutated after boot.

use crate::room::RoomSettings;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::env;

/// Immutable gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket listen port.
    pub http_port: u16,
    /// Prometheus exporter port.
    pub metrics_port: u16,
    /// DSN for the API key store (`sqlite:` or `postgres:` scheme).
    pub database_url: String,
    /// Redis URL for the durable room store; in-memory store when unset.
    pub redis_url: Option<String>,
    /// Bearer secret guarding the `/api-keys` surface; unguarded when unset.
    pub service_key: Option<String>,
    /// Projects that skip API key validation.
    pub bypass_projects: HashSet<String>,
    /// Pending-request timeout in milliseconds.
    pub request_timeout_ms: i64,
    /// How long an idle room lingers before its alarm fires, in milliseconds.
    pub idle_linger_ms: i64,
    /// Synthesize fixture responses when no agent is connected.
    pub fallback_fixtures: bool,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let http_port = env::var("BUS_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("BUS_HTTP_PORT must be a number")?;
        let metrics_port = env::var("BUS_METRICS_PORT")
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .context("BUS_METRICS_PORT must be a number")?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());
        let redis_url = env::var("REDIS_URL").ok().filter(|v| !v.is_empty());
        let service_key = env::var("SERVICE_KEY").ok().filter(|v| !v.is_empty());

        let bypass_projects = parse_project_list(
            &env::var("BYPASS_PROJECTS").unwrap_or_else(|_| "demo,demo-prod".to_string()),
        );

        let request_timeout_ms = env::var("REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .context("REQUEST_TIMEOUT_MS must be a number")?;
        let idle_linger_ms = env::var("IDLE_LINGER_MS")
            .unwrap_or_else(|_| "300000".to_string())
            .parse()
            .context("IDLE_LINGER_MS must be a number")?;
        let fallback_fixtures = env::var("FALLBACK_FIXTURES")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        Ok(Config {
            http_port,
            metrics_port,
            database_url,
            redis_url,
            service_key,
            bypass_projects,
            request_timeout_ms,
            idle_linger_ms,
            fallback_fixtures,
        })
    }

    /// The per-room slice of the configuration.
    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            request_timeout_ms: self.request_timeout_ms,
            idle_linger_ms: self.idle_linger_ms,
            fallback_fixtures: self.fallback_fixtures,
        }
    }
}

/// Parse a comma-separated project list, ignoring empty segments.
fn parse_project_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_project_list() {
        let set = parse_project_list("demo,demo-prod");
        assert!(set.contains("demo"));
        assert!(set.contains("demo-prod"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_parse_project_list_trims_and_skips_empty() {
        let set = parse_project_list(" demo , ,demo-prod,");
        assert_eq!(set.len(), 2);
        assert!(set.contains("demo"));
    }

    #[test]
    fn test_parse_project_list_empty() {
        assert!(parse_project_list("").is_empty());
    }
}

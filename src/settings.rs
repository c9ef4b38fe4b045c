//! Process configuration from environment variables (after `.env`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::mcp::ClientSettings;

#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub port: u16,
    pub client: ClientSettings,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the
    /// default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ClientSettings::default();
        let secs = |key: &str, default: Duration| Duration::from_secs(parse_or(&lookup, key, default.as_secs()));

        let client = ClientSettings {
            connect_timeout: secs("MCP_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            request_timeout: secs("MCP_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            ping_timeout: secs("MCP_PING_TIMEOUT_SECS", defaults.ping_timeout),
            health_interval: secs("MCP_HEALTH_INTERVAL_SECS", defaults.health_interval),
            reconnect_base_delay: Duration::from_millis(parse_or(
                &lookup,
                "MCP_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay.as_millis() as u64,
            )),
            reconnect_max_attempts: parse_or(&lookup, "MCP_RECONNECT_MAX_ATTEMPTS", defaults.reconnect_max_attempts),
            protocol_version: lookup("MCP_PROTOCOL_VERSION")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.protocol_version),
            ..defaults
        };

        Self {
            config_path: lookup("MCP_CONFIG_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("mcp_servers.json")),
            port: parse_or(&lookup, "PORT", 8090),
            client,
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("{}={:?} is not valid, using the default", key, raw);
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let s = settings(&[]);
        assert_eq!(s.port, 8090);
        assert_eq!(s.config_path, PathBuf::from("mcp_servers.json"));
        assert_eq!(s.client.connect_timeout, Duration::from_secs(10));
        assert_eq!(s.client.request_timeout, Duration::from_secs(30));
        assert_eq!(s.client.ping_timeout, Duration::from_secs(5));
        assert_eq!(s.client.health_interval, Duration::from_secs(30));
        assert_eq!(s.client.reconnect_base_delay, Duration::from_secs(1));
        assert_eq!(s.client.reconnect_max_attempts, 3);
        assert_eq!(s.client.protocol_version, "2024-11-05");
    }

    #[test]
    fn reads_overrides() {
        let s = settings(&[
            ("PORT", "9000"),
            ("MCP_CONFIG_PATH", "/etc/hydra/servers.json"),
            ("MCP_RECONNECT_BASE_DELAY_MS", "250"),
            ("MCP_RECONNECT_MAX_ATTEMPTS", "5"),
        ]);
        assert_eq!(s.port, 9000);
        assert_eq!(s.config_path, PathBuf::from("/etc/hydra/servers.json"));
        assert_eq!(s.client.reconnect_base_delay, Duration::from_millis(250));
        assert_eq!(s.client.reconnect_max_attempts, 5);
    }

    #[test]
    fn invalid_values_fall_back() {
        let s = settings(&[("PORT", "http"), ("MCP_PING_TIMEOUT_SECS", "-1")]);
        assert_eq!(s.port, 8090);
        assert_eq!(s.client.ping_timeout, Duration::from_secs(5));
    }
}

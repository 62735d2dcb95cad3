use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default listening port.
const DEFAULT_PORT: u16 = 3000;

/// Default endpoint path for the MCP Streamable HTTP transport.
const DEFAULT_PATH: &str = "/mcp";

/// Default timeout for tool operations (30 seconds).
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub token: String,
    pub host: IpAddr,
    pub port: u16,
    pub path: String,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub tool_timeout: Duration,
}

impl ServerConfig {
    /// Load configuration from environment.
    ///
    /// - `TOKEN` (required): shared bearer credential
    /// - `PORT` (optional, default 3000)
    /// - `MCP_HOST` (optional, default 0.0.0.0)
    /// - `MCP_PATH` (optional, default `/mcp`)
    /// - `MCP_SERVER_NAME` / `MCP_SERVER_VERSION` (optional): advertised to clients
    /// - `MCP_TOOL_TIMEOUT_SECS` (optional, default 30): max seconds per tool call
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let token = lookup("TOKEN")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "TOKEN environment variable is not set".to_string())?;

        let port = match lookup("PORT") {
            Some(val) => val
                .parse::<u16>()
                .map_err(|_| "PORT must be an integer between 0 and 65535".to_string())?,
            None => DEFAULT_PORT,
        };

        let host = match lookup("MCP_HOST") {
            Some(val) => val
                .parse::<IpAddr>()
                .map_err(|_| format!("MCP_HOST is not a valid IP address: {val}"))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let path = lookup("MCP_PATH").unwrap_or_else(|| DEFAULT_PATH.to_string());
        if !path.starts_with('/') {
            return Err("MCP_PATH must start with '/'".to_string());
        }

        let tool_timeout_secs = match lookup("MCP_TOOL_TIMEOUT_SECS") {
            Some(val) => val
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| "MCP_TOOL_TIMEOUT_SECS must be a positive integer".to_string())?,
            None => DEFAULT_TOOL_TIMEOUT_SECS,
        };

        Ok(Self {
            token,
            host,
            port,
            path,
            server_name: lookup("MCP_SERVER_NAME"),
            server_version: lookup("MCP_SERVER_VERSION"),
            tool_timeout: Duration::from_secs(tool_timeout_secs),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_token_is_set() {
        let config = load(&[("TOKEN", "t")]).unwrap();
        assert_eq!(config.token, "t");
        assert_eq!(config.port, 3000);
        assert_eq!(config.path, "/mcp");
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:3000");
        assert_eq!(config.tool_timeout, Duration::from_secs(30));
        assert!(config.server_name.is_none());
    }

    #[test]
    fn token_is_required() {
        assert!(load(&[]).is_err());
        assert!(load(&[("TOKEN", "")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("TOKEN", "t"),
            ("PORT", "8080"),
            ("MCP_HOST", "127.0.0.1"),
            ("MCP_PATH", "/rpc"),
            ("MCP_SERVER_NAME", "calc"),
            ("MCP_TOOL_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:8080");
        assert_eq!(config.path, "/rpc");
        assert_eq!(config.server_name.as_deref(), Some("calc"));
        assert_eq!(config.tool_timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(load(&[("TOKEN", "t"), ("PORT", "http")]).is_err());
        assert!(load(&[("TOKEN", "t"), ("MCP_HOST", "localhost")]).is_err());
        assert!(load(&[("TOKEN", "t"), ("MCP_PATH", "mcp")]).is_err());
        assert!(load(&[("TOKEN", "t"), ("MCP_TOOL_TIMEOUT_SECS", "0")]).is_err());
    }
}

//! HTTP client for the tunnel directory service

use serde_json::Value;
use std::time::Duration;

use super::{Destination, parse_username};
use crate::config::ExpandedDirectoryConfig;
use crate::error::{Error, Result};

const LOOKUP_PATH: &str = "/api/get_tunnel_detail";

const NOT_FOUND: &str = "tunnel not found";

/// Resolves tunnel codes to destinations
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl DirectoryClient {
    /// Create a client for `host` ("name[:port]")
    pub fn new(host: &str, ssl: bool, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let scheme = if ssl { "https" } else { "http" };
        Ok(Self {
            client,
            base_url: format!("{}://{}", scheme, host.trim_end_matches('/')),
            token: token.to_string(),
        })
    }

    pub fn from_config(config: &ExpandedDirectoryConfig) -> Result<Self> {
        Self::new(&config.host, config.ssl, &config.token, config.timeout)
    }

    /// Resolve a full login name to its destination
    pub async fn resolve(&self, username: &str) -> Result<Destination> {
        let login = parse_username(username)?;
        let (host, port) = self.lookup(&login.code).await?;
        Ok(Destination {
            code: login.code,
            host,
            port,
            user: login.user,
        })
    }

    /// Look up the host and port behind a tunnel code
    pub async fn lookup(&self, code: &str) -> Result<(String, u16)> {
        let url = format!("{}{}", self.base_url, LOOKUP_PATH);
        tracing::debug!(code = %code, url = %url, "Looking up tunnel");

        let response = self
            .client
            .get(&url)
            .query(&[("code", code), ("token", self.token.as_str())])
            .send()
            .await
            .map_err(|e| Error::Lookup(format!("directory unreachable: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Lookup(format!("failed to read directory response: {}", e)))?;
        let json: Option<Value> = serde_json::from_str(&body).ok();

        if status != reqwest::StatusCode::OK {
            let message = json
                .as_ref()
                .and_then(|v| v.get("error_message"))
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or(NOT_FOUND);
            tracing::debug!(code = %code, status = %status, "Tunnel lookup rejected");
            return Err(Error::Lookup(message.to_string()));
        }

        let json = json.ok_or_else(|| Error::Lookup(NOT_FOUND.to_string()))?;
        parse_tunnel_detail(&json)
    }
}

/// Extract `resource.ip_address` and `port` from a lookup answer
fn parse_tunnel_detail(json: &Value) -> Result<(String, u16)> {
    let host = json
        .get("resource")
        .and_then(|r| r.get("ip_address"))
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::Lookup(NOT_FOUND.to_string()))?;

    // the service has been seen to send the port as a string
    let port = match json.get("port") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .and_then(|p| u16::try_from(p).ok())
    .filter(|p| *p != 0)
    .ok_or_else(|| Error::Lookup(format!("invalid port for tunnel {}", host)))?;

    Ok((host.to_string(), port))
}

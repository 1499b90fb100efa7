// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Agent configuration and per-request connection options.
//!
//! Option names follow the Node.js `http.Agent` constructor (`keepAlive`,
//! `maxSockets`, ...) so that JSON configuration written for Node can be
//! loaded unchanged. Values are validated once, when the agent is built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Prefix for environment variable overrides (`SPACEY_AGENT_MAX_SOCKETS=8`)
pub const ENV_PREFIX: &str = "SPACEY_AGENT_";

/// Default `keepAliveMsecs`
pub const DEFAULT_KEEP_ALIVE_MSECS: u64 = 1000;

/// Default `maxFreeSockets`
pub const DEFAULT_MAX_FREE_SOCKETS: usize = 256;

/// Default number of TLS sessions kept by an HTTPS agent
pub const DEFAULT_MAX_CACHED_SESSIONS: usize = 100;

/// Order in which idle sockets are handed out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scheduling {
    /// Oldest idle socket first
    Fifo,
    /// Most recently used idle socket first
    #[default]
    Lifo,
}

impl Scheduling {
    /// Name used in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheduling::Fifo => "fifo",
            Scheduling::Lifo => "lifo",
        }
    }
}

impl fmt::Display for Scheduling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheduling {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(Scheduling::Fifo),
            "lifo" => Ok(Scheduling::Lifo),
            other => Err(AgentError::invalid_arg("scheduling", other)),
        }
    }
}

impl TryFrom<String> for Scheduling {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Scheduling> for String {
    fn from(value: Scheduling) -> Self {
        value.as_str().to_string()
    }
}

/// Agent construction options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentOptions {
    /// Keep sockets around for future requests
    pub keep_alive: bool,
    /// Initial delay for TCP keep-alive probes, in milliseconds
    pub keep_alive_msecs: u64,
    /// Maximum sockets per endpoint (`None` is unbounded)
    pub max_sockets: Option<usize>,
    /// Maximum idle sockets per endpoint
    pub max_free_sockets: usize,
    /// Maximum sockets across all endpoints (`None` is unbounded)
    pub max_total_sockets: Option<usize>,
    /// Idle socket selection order
    pub scheduling: Scheduling,
    /// Idle socket timeout in milliseconds
    pub timeout: Option<u64>,
    /// TLS sessions remembered by HTTPS agents
    pub max_cached_sessions: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            keep_alive: false,
            keep_alive_msecs: DEFAULT_KEEP_ALIVE_MSECS,
            max_sockets: None,
            max_free_sockets: DEFAULT_MAX_FREE_SOCKETS,
            max_total_sockets: None,
            scheduling: Scheduling::Lifo,
            timeout: None,
            max_cached_sessions: DEFAULT_MAX_CACHED_SESSIONS,
        }
    }
}

impl AgentOptions {
    /// Options for a keep-alive agent
    pub fn keep_alive() -> Self {
        Self {
            keep_alive: true,
            ..Self::default()
        }
    }

    /// Check option ranges.
    ///
    /// `maxSockets: 0` falls back to unbounded, matching Node's
    /// `options.maxSockets || Infinity`; `maxTotalSockets` must be positive.
    pub fn validate(mut self) -> Result<Self> {
        if self.max_sockets == Some(0) {
            self.max_sockets = None;
        }
        if self.max_total_sockets == Some(0) {
            return Err(AgentError::out_of_range("maxTotalSockets", 0));
        }
        if self.timeout == Some(0) {
            self.timeout = None;
        }
        Ok(self)
    }

    /// Effective per-endpoint socket limit
    pub fn socket_limit(&self) -> usize {
        self.max_sockets.unwrap_or(usize::MAX)
    }

    /// Effective global socket limit
    pub fn total_socket_limit(&self) -> usize {
        self.max_total_sockets.unwrap_or(usize::MAX)
    }

    /// Idle timeout configured on the agent
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }

    /// Load options from a JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut options = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        options.load_from_env()?;
        options.validate()
    }

    /// Parse options from a JSON file using Node.js option names
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse options from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `SPACEY_AGENT_*` environment variables.
    pub fn load_from_env(&mut self) -> Result<()> {
        self.apply_vars(std::env::vars())
    }

    fn apply_vars(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                let config_key = config_key.to_lowercase().replace('_', "-");
                self.set(&config_key, &value)?;
            }
        }
        Ok(())
    }

    /// Set a single option from its kebab-case name.
    ///
    /// `infinity` (or an empty value) clears the optional limits.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "keep-alive" => self.keep_alive = parse_bool(key, value)?,
            "keep-alive-msecs" => self.keep_alive_msecs = parse_number(key, value)?,
            "max-sockets" => self.max_sockets = parse_limit(key, value)?,
            "max-free-sockets" => self.max_free_sockets = parse_number(key, value)?,
            "max-total-sockets" => self.max_total_sockets = parse_limit(key, value)?,
            "scheduling" => self.scheduling = value.parse()?,
            "timeout" => self.timeout = parse_limit(key, value)?,
            "max-cached-sessions" => self.max_cached_sessions = parse_number(key, value)?,
            other => {
                return Err(AgentError::Config(format!("unknown option '{}'", other)));
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(AgentError::Config(format!(
            "expected a boolean for '{}', got '{}'",
            key, value
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        AgentError::Config(format!("expected a number for '{}', got '{}'", key, value))
    })
}

fn parse_limit<T: FromStr>(key: &str, value: &str) -> Result<Option<T>> {
    if value.is_empty() || value.eq_ignore_ascii_case("infinity") {
        return Ok(None);
    }
    parse_number(key, value).map(Some)
}

/// TLS options that partition the pool of an HTTPS agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsOptions {
    /// Trusted CA bundle (PEM)
    pub ca: Option<String>,
    /// Client certificate (PEM)
    pub cert: Option<String>,
    /// Cipher suite list
    pub ciphers: Option<String>,
    /// Client private key (PEM)
    pub key: Option<String>,
    /// Whether to verify the server certificate
    pub reject_unauthorized: Option<bool>,
    /// SNI server name
    pub servername: Option<String>,
    /// Minimum TLS version
    pub min_version: Option<String>,
    /// Maximum TLS version
    pub max_version: Option<String>,
}

/// Options describing where a request connects to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectOptions {
    /// Remote host name or address
    pub host: Option<String>,
    /// Remote port
    pub port: Option<u16>,
    /// Local interface to bind
    pub local_address: Option<String>,
    /// Address family (4 or 6)
    pub family: Option<u8>,
    /// Unix domain socket path
    pub socket_path: Option<String>,
    /// TLS parameters for HTTPS agents
    pub tls: Option<TlsOptions>,
    /// Enable TCP keep-alive on the new socket
    pub keep_alive: bool,
    /// Delay before the first keep-alive probe, in milliseconds
    pub keep_alive_initial_delay: u64,
}

impl ConnectOptions {
    /// Options for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Self::default()
        }
    }

    /// Options for a unix domain socket
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            socket_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Normalize the legacy `(host, port, localAddress)` argument form
    pub fn legacy(host: &str, port: Option<u16>, local_address: Option<&str>) -> Self {
        Self {
            host: Some(host.to_string()),
            port,
            local_address: local_address.map(str::to_string),
            ..Self::default()
        }
    }

    /// Bind to a local address
    pub fn with_local_address(mut self, address: impl Into<String>) -> Self {
        self.local_address = Some(address.into());
        self
    }

    /// Restrict the address family
    pub fn with_family(mut self, family: u8) -> Self {
        self.family = Some(family);
        self
    }

    /// Attach TLS options
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Host name, defaulting to `localhost`
    pub fn host_or_default(&self) -> &str {
        match self.host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => "localhost",
        }
    }

    /// Fill in the SNI server name from the host when it is not an IP literal
    pub fn normalize_server_name(&mut self) {
        let host = self.host_or_default().to_string();
        if let Some(tls) = self.tls.as_mut() {
            if tls.servername.is_none() && host.parse::<std::net::IpAddr>().is_err() {
                tls.servername = Some(host);
            }
        }
    }

    /// Copy the agent-level socket settings onto these options
    pub(crate) fn apply_agent(&mut self, agent: &AgentOptions) {
        if agent.keep_alive {
            self.keep_alive = true;
            self.keep_alive_initial_delay = agent.keep_alive_msecs;
        }
        self.normalize_server_name();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = AgentOptions::default();
        assert!(!options.keep_alive);
        assert_eq!(options.keep_alive_msecs, 1000);
        assert_eq!(options.max_free_sockets, 256);
        assert_eq!(options.socket_limit(), usize::MAX);
        assert_eq!(options.total_socket_limit(), usize::MAX);
        assert_eq!(options.scheduling, Scheduling::Lifo);
    }

    #[test]
    fn test_scheduling_parse() {
        assert_eq!("fifo".parse::<Scheduling>().unwrap(), Scheduling::Fifo);
        assert_eq!("lifo".parse::<Scheduling>().unwrap(), Scheduling::Lifo);
        let err = "random".parse::<Scheduling>().unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgValue { name: "scheduling", .. }));
    }

    #[test]
    fn test_validate_total_sockets() {
        let options = AgentOptions {
            max_total_sockets: Some(0),
            ..AgentOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(AgentError::OutOfRange { name: "maxTotalSockets", .. })
        ));

        let options = AgentOptions {
            max_sockets: Some(0),
            ..AgentOptions::default()
        }
        .validate()
        .unwrap();
        assert_eq!(options.max_sockets, None);
    }

    #[test]
    fn test_from_json() {
        let options = AgentOptions::from_json_str(
            r#"{"keepAlive": true, "maxSockets": 4, "scheduling": "fifo", "timeout": 5000}"#,
        )
        .unwrap();
        assert!(options.keep_alive);
        assert_eq!(options.max_sockets, Some(4));
        assert_eq!(options.scheduling, Scheduling::Fifo);
        assert_eq!(options.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(options.max_free_sockets, 256);

        assert!(AgentOptions::from_json_str(r#"{"scheduling": "round-robin"}"#).is_err());
    }

    #[test]
    fn test_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"maxFreeSockets": 2, "maxTotalSockets": 10}"#).unwrap();

        let options = AgentOptions::from_json_file(&path).unwrap();
        assert_eq!(options.max_free_sockets, 2);
        assert_eq!(options.max_total_sockets, Some(10));
    }

    #[test]
    fn test_env_overrides() {
        let mut options = AgentOptions::default();
        options
            .apply_vars(vec![
                ("SPACEY_AGENT_KEEP_ALIVE".to_string(), "true".to_string()),
                ("SPACEY_AGENT_MAX_SOCKETS".to_string(), "8".to_string()),
                ("SPACEY_AGENT_SCHEDULING".to_string(), "fifo".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ])
            .unwrap();
        assert!(options.keep_alive);
        assert_eq!(options.max_sockets, Some(8));
        assert_eq!(options.scheduling, Scheduling::Fifo);

        options.set("max-sockets", "Infinity").unwrap();
        assert_eq!(options.max_sockets, None);
        assert!(options.set("max-sockets", "lots").is_err());
        assert!(options.set("bogus", "1").is_err());
    }

    #[test]
    fn test_legacy_options() {
        let legacy = ConnectOptions::legacy("example.com", Some(8080), Some("10.0.0.2"));
        let modern = ConnectOptions::new("example.com", 8080).with_local_address("10.0.0.2");
        assert_eq!(legacy, modern);
    }

    #[test]
    fn test_normalize_server_name() {
        let mut options =
            ConnectOptions::new("example.com", 443).with_tls(TlsOptions::default());
        options.normalize_server_name();
        assert_eq!(
            options.tls.as_ref().and_then(|t| t.servername.as_deref()),
            Some("example.com")
        );

        let mut options = ConnectOptions::new("127.0.0.1", 443).with_tls(TlsOptions::default());
        options.normalize_server_name();
        assert_eq!(options.tls.unwrap().servername, None);
    }
}

//! Bus configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::watch::WatchOptions;
use crate::DEFAULT_CONSUL_URI;

/// Connection and watch settings for an [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Consul agent HTTP endpoint.
    pub consul_uri: String,

    /// ACL token sent as `X-Consul-Token`.
    pub token: Option<String>,

    /// Datacenter to query instead of the agent's own.
    pub datacenter: Option<String>,

    /// TCP connect timeout for requests to the agent.
    pub connect_timeout: Duration,

    /// Blocking-query and retry behaviour of the watch.
    pub watch: WatchOptions,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            consul_uri: DEFAULT_CONSUL_URI.to_string(),
            token: None,
            datacenter: None,
            connect_timeout: Duration::from_secs(5),
            watch: WatchOptions::default(),
        }
    }
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PONG_CONSUL_URI` or `CONSUL_HTTP_ADDR`: agent endpoint (default: http://localhost:8500)
    /// - `CONSUL_HTTP_TOKEN`: ACL token (default: none)
    /// - `PONG_DATACENTER`: datacenter (default: agent's own)
    /// - `PONG_HTTP_TIMEOUT_SECS`: connect timeout (default: 5)
    /// - `PONG_WATCH_WAIT_SECS`: blocking query wait (default: 300)
    /// - `PONG_WATCH_MAX_RETRIES`: consecutive failures tolerated (default: 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let consul_uri = env::var("PONG_CONSUL_URI")
            .or_else(|_| env::var("CONSUL_HTTP_ADDR"))
            .map(|uri| normalize_uri(&uri))
            .unwrap_or(defaults.consul_uri);

        let mut watch = defaults.watch;
        if let Some(secs) = parse_env::<u64>("PONG_WATCH_WAIT_SECS") {
            watch.wait = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_env::<u32>("PONG_WATCH_MAX_RETRIES") {
            watch.max_retries = retries;
        }

        Self {
            consul_uri,
            token: env::var("CONSUL_HTTP_TOKEN").ok().filter(|t| !t.is_empty()),
            datacenter: env::var("PONG_DATACENTER").ok().filter(|d| !d.is_empty()),
            connect_timeout: parse_env::<u64>("PONG_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            watch,
        }
    }

    /// Use `uri` as the agent endpoint. An empty string keeps the default.
    #[must_use]
    pub fn with_consul_uri(mut self, uri: &str) -> Self {
        if !uri.trim().is_empty() {
            self.consul_uri = normalize_uri(uri);
        }
        self
    }

    /// Set the ACL token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the datacenter.
    #[must_use]
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Replace the watch options.
    #[must_use]
    pub fn with_watch(mut self, watch: WatchOptions) -> Self {
        self.watch = watch;
        self
    }
}

/// `CONSUL_HTTP_ADDR` is commonly given as `host:port` without a scheme.
fn normalize_uri(uri: &str) -> String {
    let uri = uri.trim().trim_end_matches('/');
    if uri.contains("://") {
        uri.to_string()
    } else {
        format!("http://{uri}")
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

use std::time::Duration;

use anyhow::{anyhow, bail};
use tracing::debug;
use url::Url;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16*1024*1024;

/// Selects the framing family a connection's protocol speaks. The transport core itself is
///  agnostic of the framing, it just carries the selection through to whoever picks the
///  [crate::protocol::Protocol] implementation.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum FramingMode {
    Adi,
    #[default]
    Raw,
}

/// How many times a failed connection attempt is retried before the connector gives up.
///
/// NB: `Limited(0)` means a single attempt without any retry
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryBudget {
    Limited(u32),
    Unlimited,
}
impl Default for RetryBudget {
    fn default() -> Self {
        RetryBudget::Limited(0)
    }
}
impl RetryBudget {
    /// consumes one retry, returning `false` if the budget was already exhausted
    #[must_use]
    pub fn try_consume(&mut self) -> bool {
        match self {
            RetryBudget::Unlimited => true,
            RetryBudget::Limited(0) => false,
            RetryBudget::Limited(n) => {
                *n -= 1;
                true
            }
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportConfig {
    /// default ttl for fresh messages sent on a connection
    pub ttl: Option<u8>,
    /// default priority for fresh messages sent on a connection
    pub priority: Option<u8>,
    /// carried for the caller that picks the [crate::protocol::Protocol], not read by the core
    pub framing: FramingMode,

    pub retry: RetryBudget,
    pub retry_interval: Duration,
    /// Reconnect after an established connection is lost. This has no influence on retries
    ///  of failed connection attempts, which are governed by `retry` alone.
    pub reconnect: bool,
    /// bound on the connect call only, `None` waits for the OS to give up
    pub connect_timeout: Option<Duration>,

    /// an idle connection sends a chirp after this interval
    pub keepalive_interval: Option<Duration>,
    /// upper bound for a single frame, enforced by the framing through
    ///  [crate::connection::Connection::max_message_size]
    pub max_message_size: usize,

    pub message_pool_size: usize,
    pub message_body_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            ttl: None,
            priority: None,
            framing: FramingMode::Raw,
            retry: RetryBudget::default(),
            retry_interval: Duration::from_secs(5),
            reconnect: false,
            connect_timeout: None,
            keepalive_interval: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            message_pool_size: 256,
            message_body_capacity: 1024,
        }
    }
}

impl TransportConfig {
    /// Applies a single `key=value` option. Unknown keys are ignored, and malformed values
    ///  leave the previous value in place.
    pub fn apply_option(&mut self, key: &str, value: &str) {
        let result = match key {
            "ttl" => value.parse().map(|v| self.ttl = Some(v)).map_err(|e| anyhow!(e)),
            "priority" => value.parse().map(|v| self.priority = Some(v)).map_err(|e| anyhow!(e)),
            "adi" => { self.framing = FramingMode::Adi; Ok(()) }
            "raw" => { self.framing = FramingMode::Raw; Ok(()) }
            "retry" => value.parse::<i64>()
                .map(|v| self.retry = match u32::try_from(v) {
                    Ok(n) => RetryBudget::Limited(n),
                    Err(_) if v < 0 => RetryBudget::Unlimited,
                    Err(_) => RetryBudget::Limited(u32::MAX),
                })
                .map_err(|e| anyhow!(e)),
            "retryint" => parse_seconds(value).map(|d| self.retry_interval = d),
            "reconnect" => parse_flag(value).map(|b| self.reconnect = b),
            "timeout" => parse_seconds(value).map(|d| self.connect_timeout = Some(d).filter(|d| !d.is_zero())),
            "keepalive" => parse_seconds(value).map(|d| self.keepalive_interval = Some(d).filter(|d| !d.is_zero())),
            "maxmsg" => value.parse().map(|v| self.max_message_size = v).map_err(|e| anyhow!(e)),
            _ => {
                debug!("ignoring unknown transport option {:?}", key);
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!("malformed value {:?} for transport option {:?}, keeping previous value: {}", value, key, e);
        }
    }

    pub fn from_query(query: &str) -> TransportConfig {
        let mut result = TransportConfig::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            result.apply_option(&key, &value);
        }
        result
    }
}

fn parse_seconds(value: &str) -> anyhow::Result<Duration> {
    Ok(Duration::try_from_secs_f64(value.parse()?)?)
}

fn parse_flag(value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "" | "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => bail!("not a valid flag"),
    }
}


/// A connection target in the form `xts://host:port/target?option=value&...`
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TargetUrl {
    pub host: String,
    pub port: u16,
    /// the target id, i.e. the URL's path without the leading slash
    pub target: String,
    pub config: TransportConfig,
}

impl TargetUrl {
    pub const SCHEME: &'static str = "xts";

    pub fn parse(raw: &str) -> anyhow::Result<TargetUrl> {
        let url = Url::parse(raw)?;
        if url.scheme() != Self::SCHEME {
            bail!("unsupported scheme {:?} in {:?}", url.scheme(), raw);
        }

        let host = url.host_str()
            .ok_or_else(|| anyhow!("no host in {:?}", raw))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port()
            .ok_or_else(|| anyhow!("no port in {:?}", raw))?;

        Ok(TargetUrl {
            host,
            port,
            target: url.path().trim_start_matches('/').to_string(),
            config: TransportConfig::from_query(url.query().unwrap_or("")),
        })
    }

    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        }
        else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

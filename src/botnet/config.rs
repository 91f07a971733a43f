/// Relay configuration, read from `EGGNAT_*` environment variables.
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::intenc::IntEncoding;
use super::mux::MuxConfig;

const DEFAULT_LISTEN: &str = "[::1]:6512";
const DEFAULT_HANDLE: &str = "defense";
const DEFAULT_BLOCK_SIZE: u32 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// How the integer encoding of a link is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingMode {
    /// From the uplink's numeric version.
    Auto,
    Fixed(IntEncoding),
}

/// Where and how to reach the uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// PEM bundle of trust roots for the uplink's certificate.
    pub ca_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl LinkConfig {
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Everything a single relay session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub fake_handle: String,
    pub password: String,
    pub leaf_mode: bool,
    pub mux: MuxConfig,
    /// Outbound idle time before a ping goes to the uplink.
    pub keepalive: Duration,
    /// How long an unanswered ping may stay outstanding before it is logged.
    pub pong_timeout: Duration,
    pub encoding: EncodingMode,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub link: LinkConfig,
    pub session: Arc<SessionConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source (the environment, or a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let link = get("EGGNAT_LINK").ok_or(ConfigError::Missing("EGGNAT_LINK"))?;
        let (host, port) = parse_host_port(&link).ok_or_else(|| ConfigError::Invalid {
            var: "EGGNAT_LINK",
            value: link.clone(),
            reason: "expected host:port".into(),
        })?;

        let tls = parse_flag("EGGNAT_LINK_TLS", get("EGGNAT_LINK_TLS"), false)?;
        let ca_file = get("EGGNAT_LINK_CA").map(PathBuf::from);
        if tls && ca_file.is_none() {
            return Err(ConfigError::Missing("EGGNAT_LINK_CA"));
        }

        let password = get("EGGNAT_PASSWORD").ok_or(ConfigError::Missing("EGGNAT_PASSWORD"))?;
        let fake_handle = get("EGGNAT_HANDLE").unwrap_or_else(|| DEFAULT_HANDLE.into());
        if !fake_handle.is_ascii() || fake_handle.contains([' ', ':', '@']) {
            return Err(ConfigError::Invalid {
                var: "EGGNAT_HANDLE",
                value: fake_handle,
                reason: "handles are ASCII without spaces, ':' or '@'".into(),
            });
        }

        let block_size = match get("EGGNAT_IDX_BLOCK") {
            Some(v) => v
                .parse::<u32>()
                .ok()
                .and_then(NonZeroU32::new)
                .ok_or_else(|| ConfigError::Invalid {
                    var: "EGGNAT_IDX_BLOCK",
                    value: v.clone(),
                    reason: "expected a positive integer".into(),
                })?,
            None => NonZeroU32::new(DEFAULT_BLOCK_SIZE).unwrap_or(NonZeroU32::MIN),
        };

        let encoding = match get("EGGNAT_INT_ENCODING").as_deref() {
            None | Some("auto") => EncodingMode::Auto,
            Some("decimal") => EncodingMode::Fixed(IntEncoding::Decimal),
            Some("base64") | Some("newnet") => EncodingMode::Fixed(IntEncoding::NetBase64),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "EGGNAT_INT_ENCODING",
                    value: other.into(),
                    reason: "expected auto, decimal or base64".into(),
                })
            }
        };

        Ok(Self {
            listen: get("EGGNAT_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.into()),
            link: LinkConfig {
                host,
                port,
                tls,
                ca_file,
                connect_timeout: parse_secs("EGGNAT_CONNECT_TIMEOUT", get("EGGNAT_CONNECT_TIMEOUT"), 10)?,
            },
            session: Arc::new(SessionConfig {
                fake_handle,
                password,
                leaf_mode: parse_flag("EGGNAT_LEAF", get("EGGNAT_LEAF"), true)?,
                mux: MuxConfig { block_size },
                keepalive: parse_secs("EGGNAT_KEEPALIVE", get("EGGNAT_KEEPALIVE"), 5)?,
                pong_timeout: parse_secs("EGGNAT_PONG_TIMEOUT", get("EGGNAT_PONG_TIMEOUT"), 30)?,
                encoding,
            }),
        })
    }
}

fn parse_flag(var: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value,
            reason: "expected a boolean".into(),
        }),
    }
}

fn parse_secs(var: &'static str, value: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(Duration::from_secs(default)),
        Some(v) => match v.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::Invalid {
                var,
                value: v,
                reason: "expected a positive number of seconds".into(),
            }),
        },
    }
}

/// Split `host:port`, accepting `[v6]:port`.
pub fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        (host, port)
    } else {
        s.rsplit_once(':')?
    };
    if host.is_empty() || host.contains(' ') {
        return None;
    }
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    Some((host.to_string(), port))
}

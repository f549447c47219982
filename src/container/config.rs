//! Container configuration.
//!
//! Describes one workload's desired state as declared in a stack file, plus
//! the parsing helpers shared by every backend (byte sizes, durations, port
//! descriptors and `host:port` addresses).

use crate::container::{ContainerError, Result};
use crate::env;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which fields a backend insists on before it will start a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirements {
    /// An image reference must be present
    pub image: bool,
    /// A command must be present
    pub command: bool,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            image: true,
            command: false,
        }
    }
}

/// One workload's runtime parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Engine override, e.g. `docker://` or `kubernetes://namespace`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub engine: String,
    /// Name, unique within a stack
    pub name: String,
    /// Hostname given to the workload (defaults to the name)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// User to run as
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Command and arguments
    pub cmd: Vec<String>,
    /// Image reference
    pub image: String,
    /// Memory limit as a human-readable size ("512m", "2GiB")
    #[serde(skip_serializing_if = "String::is_empty")]
    pub memory: String,
    /// Shared memory size as a human-readable size
    #[serde(rename = "shm", skip_serializing_if = "String::is_empty")]
    pub shared_memory: String,
    /// Port descriptors (`host:container/proto`)
    pub ports: Vec<String>,
    /// Volume binds (`host:container[:mode]`)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// Labels attached to the workload
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Run with elevated privileges
    pub privileged: bool,
    /// Working directory
    #[serde(rename = "pwd", skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    /// Address the workload is reachable at once running
    #[serde(rename = "address")]
    pub target_addr: String,
    /// Restart interval as a duration string
    #[serde(rename = "interval", skip_serializing_if = "String::is_empty")]
    pub restart_interval: String,
    /// Last observed running state, written by the stack monitor
    #[serde(skip_deserializing)]
    pub running: bool,
}

/// Resource limits resolved from a config's human-readable sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    /// Memory limit in bytes
    pub memory: u64,
    /// Shared memory size in bytes
    pub shared_memory: u64,
}

impl ContainerConfig {
    /// Create a config with a name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Set the command to run.
    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Set the engine override.
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Check that name and image are present.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        self.validate_with(Requirements::default())
    }

    /// Check the fields a particular backend requires.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first missing field.
    pub fn validate_with(&self, requirements: Requirements) -> Result<()> {
        if self.name.is_empty() {
            return Err(ContainerError::ConfigError(
                "container config: must specify a name".to_string(),
            ));
        }

        if requirements.image && self.image.is_empty() {
            return Err(ContainerError::ConfigError(
                "container config: must specify a container image".to_string(),
            ));
        }

        if requirements.command && self.cmd.is_empty() {
            return Err(ContainerError::ConfigError(
                "container config: must provide a command to run inside the container"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Fill in per-backend defaults and resolve resource sizes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a size or interval cannot be parsed.
    pub fn apply_defaults(&mut self) -> Result<Resources> {
        if self.hostname.is_empty() {
            self.hostname = self.name.clone();
        }

        if self.memory.is_empty() {
            self.memory = env::container::DEFAULT_MEMORY.to_string();
        }

        if self.shared_memory.is_empty() {
            self.shared_memory = env::container::DEFAULT_SHARED_MEMORY.to_string();
        }

        if self.target_addr.is_empty() {
            self.target_addr = match self.port_mappings()?.first() {
                Some(port) => join_host_port(env::container::DEFAULT_TARGET_HOST, port.host),
                None => env::container::DEFAULT_TARGET_HOST.to_string(),
            };
        }

        if !self.restart_interval.is_empty() {
            parse_duration(&self.restart_interval).map_err(|e| {
                ContainerError::ConfigError(format!("container-interval: {}", e))
            })?;
        }

        let memory = parse_bytes(&self.memory)
            .map_err(|e| ContainerError::ConfigError(format!("container-memory: {}", e)))?;
        let shared_memory = parse_bytes(&self.shared_memory)
            .map_err(|e| ContainerError::ConfigError(format!("container-shm-size: {}", e)))?;

        Ok(Resources {
            memory,
            shared_memory,
        })
    }

    /// Rewrite the port of the target address, returning the result.
    ///
    /// Leaves the address untouched when it has no `host:port` form yet.
    pub fn set_target_port(&mut self, port: u16) -> String {
        if let Some((host, _)) = split_host_port(&self.target_addr) {
            self.target_addr = join_host_port(host, port);
        }

        self.target_addr.clone()
    }

    /// Append a port descriptor; an empty protocol means tcp.
    pub fn add_port(&mut self, outer: u16, inner: u16, proto: &str) {
        let proto = if proto.is_empty() {
            env::container::DEFAULT_PORT_TRANSPORT
        } else {
            proto
        };

        self.ports.push(format!("{}:{}/{}", outer, inner, proto));
    }

    /// Parse the declared port descriptors.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for the first malformed descriptor.
    pub fn port_mappings(&self) -> Result<Vec<PortMapping>> {
        self.ports.iter().map(|p| p.parse()).collect()
    }

    /// Environment as `KEY=value` pairs.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// A parsed `host:container/proto` port descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Port published on the host
    pub host: u16,
    /// Port inside the workload
    pub container: u16,
    /// Transport protocol (`tcp`, `udp`, `sctp`)
    pub protocol: String,
}

impl FromStr for PortMapping {
    type Err = ContainerError;

    fn from_str(spec: &str) -> Result<Self> {
        let invalid = || ContainerError::ConfigError(format!("invalid port spec {:?}", spec));

        let (ports, protocol) = match spec.split_once('/') {
            Some((ports, proto)) if !proto.is_empty() => (ports, proto.to_lowercase()),
            Some(_) => return Err(invalid()),
            None => (spec, env::container::DEFAULT_PORT_TRANSPORT.to_string()),
        };

        if !matches!(protocol.as_str(), "tcp" | "udp" | "sctp") {
            return Err(invalid());
        }

        let (host, container) = match ports.split_once(':') {
            Some((host, container)) => (host, container),
            None => (ports, ports),
        };

        Ok(Self {
            host: host.trim().parse().map_err(|_| invalid())?,
            container: container.trim().parse().map_err(|_| invalid())?,
            protocol,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.container, self.protocol)
    }
}

/// Parse a human-readable byte size ("512m", "1.5GiB", "1024").
///
/// Bare unit letters are decimal (k = 1000); `i` suffixes are binary
/// (Ki = 1024).
pub fn parse_bytes(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| (&s[..i], &s[i..]))
        .unwrap_or((s.as_str(), ""));

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in size: {}", s))?;

    let multiplier: u64 = match suffix.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "ki" | "kib" => 1 << 10,
        "m" | "mb" => 1_000_000,
        "mi" | "mib" => 1 << 20,
        "g" | "gb" => 1_000_000_000,
        "gi" | "gib" => 1 << 30,
        "t" | "tb" => 1_000_000_000_000,
        "ti" | "tib" => 1 << 40,
        other => return Err(format!("unknown size suffix: {}", other)),
    };

    Ok((num * multiplier as f64) as u64)
}

/// Parse a duration string like "30s", "250ms", "1m30s" or "1.5h".
///
/// A bare integer is seconds. Compound values sum their parts; each part
/// is a decimal number followed by a unit (`ns`, `us`, `ms`, `s`, `m`, `h`).
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (num, tail) = rest.split_at(num_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);

        let nanos = duration_unit(unit.trim())
            .ok_or_else(|| format!("unknown duration unit {:?} in {}", unit.trim(), s))?;
        let part = scale(num, nanos).ok_or_else(|| format!("invalid number in duration: {}", s))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration out of range: {}", s))?;
        rest = next;
    }

    u64::try_from(total)
        .map(Duration::from_nanos)
        .map_err(|_| format!("duration out of range: {}", s))
}

/// Nanoseconds per unit.
fn duration_unit(unit: &str) -> Option<u128> {
    let nanos = match unit {
        "ns" | "nanos" => 1,
        "us" | "µs" | "μs" | "micros" => 1_000,
        "ms" | "millis" | "millisecond" | "milliseconds" => 1_000_000,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000_000_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60 * 1_000_000_000,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600 * 1_000_000_000,
        _ => return None,
    };
    Some(nanos)
}

/// `num` (decimal, optional fraction) times `unit` nanoseconds.
fn scale(num: &str, unit: u128) -> Option<u128> {
    let (whole, frac) = num.split_once('.').unwrap_or((num, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut value = whole.checked_mul(unit)?;

    if !frac.is_empty() {
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let frac: f64 = format!("0.{}", frac).parse().ok()?;
        value = value.checked_add((frac * unit as f64) as u128)?;
    }

    Some(value)
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }

    Some((host, port))
}

/// Join a host and port, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

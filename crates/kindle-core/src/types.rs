//! Core value types shared by the engine and the CLI.
//!
//! Nothing in here touches processes or the filesystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// --- Enumerations ---

/// Severity at which a stream of child output is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!(
                "invalid log level '{s}', expected one of: DEBUG, INFO, WARNING, ERROR"
            )),
        }
    }
}

/// Which output channel of a child process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Tag injected into the log template (`{stream}`).
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Where a cluster object is in its lifecycle.
///
/// Failures never park a cluster in a dedicated state; a failing step leaves
/// the state it found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Created,
    Verified,
    Deleted,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Created => "CREATED",
            Self::Verified => "VERIFIED",
            Self::Deleted => "DELETED",
        }
    }

    /// `Verified` implies `Created`.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created | Self::Verified)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Sctp => "SCTP",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "SCTP" => Ok(Self::Sctp),
            _ => Err(format!("invalid protocol '{s}', expected: TCP, UDP, SCTP")),
        }
    }
}

/// Forwarding rule from a host port to a port on the control-plane node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

impl PortMapping {
    pub fn new(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
            protocol: None,
        }
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

/// Parses `container:host` or `container:host/PROTO`.
impl FromStr for PortMapping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, proto)) => (ports, Some(proto.parse::<Protocol>()?)),
            None => (s, None),
        };
        let Some((container, host)) = ports.split_once(':') else {
            return Err(format!(
                "invalid port mapping '{s}', expected container:host[/protocol]"
            ));
        };
        let container_port = container
            .trim()
            .parse()
            .map_err(|_| format!("invalid container port in '{s}'"))?;
        let host_port = host
            .trim()
            .parse()
            .map_err(|_| format!("invalid host port in '{s}'"))?;
        Ok(Self {
            container_port,
            host_port,
            protocol,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container_port, self.host_port)?;
        if let Some(protocol) = self.protocol {
            write!(f, "/{}", protocol.as_str())?;
        }
        Ok(())
    }
}

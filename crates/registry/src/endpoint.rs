//! Endpoint and service identity types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::RegistryError;

/// Network address of one remote provider process.
///
/// Two providers with the same host and port are the same endpoint, whatever
/// services they publish.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct EndpointAddr {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl EndpointAddr {
    /// Create a new endpoint address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Reject addresses that no amount of retrying will ever reach.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidAddress` for an empty host or port 0.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.host.trim().is_empty() {
            return Err(RegistryError::InvalidAddress(self.to_string(), "empty host"));
        }
        if self.port == 0 {
            return Err(RegistryError::InvalidAddress(self.to_string(), "port 0"));
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidAddress(
                self.to_string(),
                "whitespace in host",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for EndpointAddr {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RegistryError::InvalidAddress(s.to_string(), "missing port"))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| RegistryError::InvalidAddress(s.to_string(), "invalid port"))?;
        let addr = Self::new(host.trim_start_matches('[').trim_end_matches(']'), port);
        addr.validate()?;
        Ok(addr)
    }
}

impl From<std::net::SocketAddr> for EndpointAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Logical remote service.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ServiceDescriptor {
    /// Fully qualified service name, the key of the provider map.
    pub name: String,
    /// Interface version.
    pub version: String,
    /// Deployment group.
    pub group: String,
}

impl ServiceDescriptor {
    /// Create a descriptor with empty version and group
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the version
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the group
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.version.is_empty() {
            write!(f, ":{}", self.version)?;
        }
        if !self.group.is_empty() {
            write!(f, "@{}", self.group)?;
        }
        Ok(())
    }
}

/// One provider of one service, as published to the registry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProviderEndpoint {
    /// Where the provider listens
    pub addr: EndpointAddr,
    /// Service it serves
    pub service: ServiceDescriptor,
    /// Remote application key
    pub app_key: String,
    /// Relative load-balancing weight
    pub weight: u32,
}

impl ProviderEndpoint {
    /// Create a provider with weight 1 and an empty application key
    pub fn new(addr: EndpointAddr, service: ServiceDescriptor) -> Self {
        Self {
            addr,
            service,
            app_key: String::new(),
            weight: 1,
        }
    }

    /// Set the remote application key
    #[must_use]
    pub fn with_app_key(mut self, app_key: impl Into<String>) -> Self {
        self.app_key = app_key.into();
        self
    }
}

/// What an invoker publishes about itself.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InvokerRegistration {
    /// Service being consumed
    pub service: ServiceDescriptor,
    /// Consuming application
    pub app_name: String,
    /// Consumer group
    pub group: String,
}

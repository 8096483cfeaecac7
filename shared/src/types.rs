use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::protocol::{MAX_LABEL_LEN, PROTO_TCP, PROTO_UDP};

/// Transport protocol half of a DNS-SD service type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Tcp => PROTO_TCP,
            Protocol::Udp => PROTO_UDP,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        if label.eq_ignore_ascii_case(PROTO_TCP) {
            Some(Protocol::Tcp)
        } else if label.eq_ignore_ascii_case(PROTO_UDP) {
            Some(Protocol::Udp)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseServiceTypeError {
    #[error("service type is empty")]
    Empty,
    #[error("empty label in '{0}'")]
    EmptyLabel(String),
    #[error("service label '{0}' must start with an underscore")]
    MissingUnderscore(String),
    #[error("unknown protocol label '{0}', expected _tcp or _udp")]
    UnknownProtocol(String),
    #[error("label '{0}' exceeds 63 bytes")]
    LabelTooLong(String),
    #[error("'{0}' carries a domain, use ServiceType::parse_qualified")]
    Qualified(String),
}

/// Service type, e.g. "_http._tcp". Labels are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceType {
    application: String,
    protocol: Protocol,
}

impl ServiceType {
    pub fn new(application: &str, protocol: Protocol) -> Result<Self, ParseServiceTypeError> {
        Self::from_labels(application, protocol.label())
    }

    /// Builds a service type from its two wire labels ("_http", "_tcp")
    pub fn from_labels(application: &str, protocol: &str) -> Result<Self, ParseServiceTypeError> {
        if application.is_empty() {
            return Err(ParseServiceTypeError::EmptyLabel(application.to_string()));
        }
        if !application.starts_with('_') {
            return Err(ParseServiceTypeError::MissingUnderscore(application.to_string()));
        }
        if application.len() > MAX_LABEL_LEN {
            return Err(ParseServiceTypeError::LabelTooLong(application.to_string()));
        }
        let protocol = Protocol::from_label(protocol)
            .ok_or_else(|| ParseServiceTypeError::UnknownProtocol(protocol.to_string()))?;

        Ok(Self {
            application: application.to_ascii_lowercase(),
            protocol,
        })
    }

    /// Parses "_http._tcp" optionally followed by a domain, e.g. "_http._tcp.local.".
    /// The domain, when present, is returned lowercase without the trailing dot.
    pub fn parse_qualified(input: &str) -> Result<(Self, Option<String>), ParseServiceTypeError> {
        let trimmed = input.trim().trim_end_matches('.');
        if trimmed.is_empty() {
            return Err(ParseServiceTypeError::Empty);
        }

        let mut labels = trimmed.split('.');
        let application = labels.next().unwrap_or_default();
        let protocol = labels.next().unwrap_or_default();
        let service_type = Self::from_labels(application, protocol)?;

        let rest: Vec<&str> = labels.collect();
        if rest.iter().any(|label| label.is_empty()) {
            return Err(ParseServiceTypeError::EmptyLabel(input.to_string()));
        }
        let domain = if rest.is_empty() {
            None
        } else {
            Some(rest.join(".").to_ascii_lowercase())
        };

        Ok((service_type, domain))
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.application, self.protocol.label())
    }
}

impl FromStr for ServiceType {
    type Err = ParseServiceTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::parse_qualified(s)? {
            (service_type, None) => Ok(service_type),
            (_, Some(_)) => Err(ParseServiceTypeError::Qualified(s.to_string())),
        }
    }
}

impl TryFrom<String> for ServiceType {
    type Error = ParseServiceTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceType> for String {
    fn from(value: ServiceType) -> Self {
        value.to_string()
    }
}

/// Identity of a service instance: (instance name, service type, domain).
/// Never changes once an instance is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Instance label, e.g. "Printer A" (may contain dots and spaces)
    pub name: String,
    pub service_type: ServiceType,
    /// Domain without trailing dot, e.g. "local"
    pub domain: String,
}

impl InstanceKey {
    pub fn new(name: impl Into<String>, service_type: ServiceType, domain: &str) -> Self {
        Self {
            name: name.into(),
            service_type,
            domain: domain.trim_end_matches('.').to_ascii_lowercase(),
        }
    }

    /// Full DNS-SD name, e.g. "Printer A._ipp._tcp.local."
    pub fn full_name(&self) -> String {
        format!("{}.{}.{}.", self.name, self.service_type, self.domain)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// TXT attributes in wire order. Keys are unique, compared case-insensitively;
/// the first occurrence of a key wins (RFC 6763 §6.4).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxtRecord {
    entries: Vec<(String, String)>,
}

impl TxtRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the attribute unless the key is already present
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if key.is_empty() || self.get(&key).is_some() {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TxtRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut txt = TxtRecord::new();
        for (key, value) in iter {
            txt.insert(key, value);
        }
        txt
    }
}

/// Where a resolved instance can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Host {
    Address(IpAddr),
    Name(String),
}

/// Connectable endpoint of a service instance. Shared behind `Arc` and never
/// mutated; a re-resolution produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    /// SRV target hostname, e.g. "printer.local."
    pub target: String,
    /// Addresses of the target carried alongside the SRV record
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub txt: TxtRecord,
}

impl ResolvedEndpoint {
    /// Preferred host: first IPv4 address, then any address, then the hostname
    pub fn host(&self) -> Host {
        self.addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| self.addresses.first())
            .map(|addr| Host::Address(*addr))
            .unwrap_or_else(|| Host::Name(self.target.clone()))
    }

    /// host:port, IPv6 addresses bracketed
    pub fn connection_string(&self) -> String {
        match self.host() {
            Host::Address(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            Host::Address(IpAddr::V4(v4)) => format!("{}:{}", v4, self.port),
            Host::Name(name) => format!("{}:{}", name.trim_end_matches('.'), self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionState {
    Unresolved,
    Resolving,
    Resolved,
    Expired,
}

/// A discovered service instance.
///
/// Fields are private so that an endpoint is present exactly when the state
/// is `Resolved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    key: InstanceKey,
    discovered_at: DateTime<Utc>,
    refreshed_at: DateTime<Utc>,
    /// Advertised TTL in seconds, from the last refreshing packet
    ttl: u32,
    state: ResolutionState,
    endpoint: Option<Arc<ResolvedEndpoint>>,
}

impl ServiceInstance {
    pub fn new(key: InstanceKey, ttl: u32, endpoint: Option<Arc<ResolvedEndpoint>>) -> Self {
        let now = Utc::now();
        let state = if endpoint.is_some() {
            ResolutionState::Resolved
        } else {
            ResolutionState::Unresolved
        };
        Self {
            key,
            discovered_at: now,
            refreshed_at: now,
            ttl,
            state,
            endpoint,
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }

    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn state(&self) -> ResolutionState {
        self.state
    }

    pub fn endpoint(&self) -> Option<&Arc<ResolvedEndpoint>> {
        self.endpoint.as_ref()
    }

    /// Records a refreshing advertisement
    pub fn refresh(&mut self, ttl: u32) {
        self.refreshed_at = Utc::now();
        self.ttl = ttl;
    }

    /// Replaces the endpoint wholesale and marks the instance resolved
    pub fn attach_endpoint(&mut self, endpoint: Arc<ResolvedEndpoint>) {
        self.endpoint = Some(endpoint);
        self.state = ResolutionState::Resolved;
    }

    pub fn mark_resolving(&mut self) {
        if self.endpoint.is_none() {
            self.state = ResolutionState::Resolving;
        }
    }

    pub fn mark_unresolved(&mut self) {
        if self.endpoint.is_none() {
            self.state = ResolutionState::Unresolved;
        }
    }

    pub fn expire(&mut self) {
        self.endpoint = None;
        self.state = ResolutionState::Expired;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    /// The socket or group membership went away underneath the session
    TransportClosed,
    ReceiveFailed,
    SendFailed,
}

/// Notification delivered to a session listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ServiceFound(ServiceInstance),
    /// Same identity, different endpoint
    ServiceUpdated(ServiceInstance),
    ServiceLost(InstanceKey),
    ServiceResolved {
        key: InstanceKey,
        endpoint: Arc<ResolvedEndpoint>,
    },
    /// A service type announced through type enumeration
    ServiceTypeFound {
        service_type: ServiceType,
        domain: String,
    },
    ServiceTypeLost {
        service_type: ServiceType,
        domain: String,
    },
    SessionError {
        kind: SessionErrorKind,
        detail: String,
    },
}

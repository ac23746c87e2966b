use std::{fmt, str::FromStr};

/// A gateway `Server.hosts` entry of the form `[namespace/]dnsName`.
///
/// Restricts which virtual service hosts, from which namespaces, may bind to
/// a gateway server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostSpecifier {
    namespace: NamespaceMatch,
    dns: DnsMatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NamespaceMatch {
    /// `*`, or no namespace at all.
    Any,

    /// `.`, the gateway's own namespace.
    Local,

    Exact(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DnsMatch {
    /// `*`
    Any,

    /// A left-most wildcard, e.g. `*.example.com`. Matches strict subdomains
    /// only; the apex `example.com` does not match.
    Suffix { reverse_labels: Vec<String> },

    Exact(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidHostSpecifier {
    #[error("host must not be empty")]
    Empty,

    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("dnsName must not be empty")]
    EmptyDnsName,

    #[error("host may contain at most one `/`")]
    TooManySlashes,

    #[error("wildcard may only be the whole dnsName or its left-most label")]
    MisplacedWildcard,

    #[error("dnsName must not contain empty labels")]
    EmptyLabel,
}

/// Checks whether a virtual service host in `candidate_ns` may bind to the
/// server host `server_host`, declared by a gateway in `local_ns`.
///
/// Malformed server hosts bind nothing.
pub fn matches(server_host: &str, local_ns: &str, candidate_ns: &str, candidate_host: &str) -> bool {
    match server_host.parse::<HostSpecifier>() {
        Ok(spec) => spec.matches(local_ns, candidate_ns, candidate_host),
        Err(error) => {
            tracing::debug!(%error, host = %server_host, "malformed server host");
            false
        }
    }
}

// === impl HostSpecifier ===

impl HostSpecifier {
    pub fn new(namespace: NamespaceMatch, dns: DnsMatch) -> Self {
        Self { namespace, dns }
    }

    pub fn namespace(&self) -> &NamespaceMatch {
        &self.namespace
    }

    pub fn dns(&self) -> &DnsMatch {
        &self.dns
    }

    /// `local_ns` is the namespace of the gateway declaring this host.
    pub fn matches(&self, local_ns: &str, candidate_ns: &str, candidate_host: &str) -> bool {
        self.namespace.matches(local_ns, candidate_ns) && self.dns.matches(candidate_host)
    }
}

impl FromStr for HostSpecifier {
    type Err = InvalidHostSpecifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidHostSpecifier::Empty);
        }

        let (namespace, dns) = match s.split_once('/') {
            Some((ns, dns)) => (ns.parse()?, dns),
            None => (NamespaceMatch::Any, s),
        };
        let dns = dns.parse()?;
        Ok(Self { namespace, dns })
    }
}

impl fmt::Display for HostSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.dns)
    }
}

// === impl NamespaceMatch ===

impl NamespaceMatch {
    pub fn matches(&self, local_ns: &str, candidate_ns: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Local => candidate_ns == local_ns,
            Self::Exact(ns) => candidate_ns == ns,
        }
    }
}

impl FromStr for NamespaceMatch {
    type Err = InvalidHostSpecifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(InvalidHostSpecifier::EmptyNamespace),
            "*" => Ok(Self::Any),
            "." => Ok(Self::Local),
            ns => Ok(Self::Exact(ns.to_string())),
        }
    }
}

impl fmt::Display for NamespaceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Local => f.write_str("."),
            Self::Exact(ns) => fmt::Display::fmt(ns, f),
        }
    }
}

// === impl DnsMatch ===

impl DnsMatch {
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(name) => name == host,
            Self::Suffix { reverse_labels } => {
                let mut labels = host.split('.').rev();
                for suffix in reverse_labels {
                    if labels.next() != Some(suffix.as_str()) {
                        return false;
                    }
                }
                // At least one more non-empty label, so the apex never matches.
                matches!(labels.next(), Some(label) if !label.is_empty())
            }
        }
    }
}

impl FromStr for DnsMatch {
    type Err = InvalidHostSpecifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidHostSpecifier::EmptyDnsName);
        }
        if s.contains('/') {
            return Err(InvalidHostSpecifier::TooManySlashes);
        }
        if s == "*" {
            return Ok(Self::Any);
        }

        let (wildcard, name) = match s.strip_prefix("*.") {
            Some(suffix) => (true, suffix),
            None => (false, s),
        };
        if name.contains('*') {
            return Err(InvalidHostSpecifier::MisplacedWildcard);
        }
        if name.split('.').any(str::is_empty) {
            return Err(InvalidHostSpecifier::EmptyLabel);
        }

        if wildcard {
            let reverse_labels = name.split('.').rev().map(ToString::to_string).collect();
            Ok(Self::Suffix { reverse_labels })
        } else {
            Ok(Self::Exact(name.to_string()))
        }
    }
}

impl fmt::Display for DnsMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::fmt::Write;
        match self {
            Self::Any => f.write_char('*'),
            Self::Exact(name) => fmt::Display::fmt(name, f),
            Self::Suffix { reverse_labels } => {
                f.write_char('*')?;
                for label in reverse_labels.iter().rev() {
                    write!(f, ".{}", label)?;
                }
                Ok(())
            }
        }
    }
}

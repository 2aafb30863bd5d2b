//! Entity identities: `namespace/name` keys.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Namespace + name pair as carried on the wire (deletions, lookups).
/// `namespace` is empty for cluster-scoped resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceName {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl NamespaceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self { Self::new(String::new(), name) }

    pub fn key(&self) -> IdentityKey { IdentityKey::from(self) }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() { f.write_str(&self.name) } else { write!(f, "{}/{}", self.namespace, self.name) }
    }
}

impl FromStr for NamespaceName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once('/') {
            Some((ns, name)) => NamespaceName::new(ns, name),
            None => NamespaceName::cluster(s),
        })
    }
}

/// Projection map key: `namespace/name`, or bare `name` for cluster-scoped entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str { &self.0 }

    pub fn namespace_name(&self) -> NamespaceName {
        self.0.parse().unwrap_or_default()
    }
}

impl From<&NamespaceName> for IdentityKey {
    fn from(nn: &NamespaceName) -> Self { IdentityKey(nn.to_string()) }
}

impl From<NamespaceName> for IdentityKey {
    fn from(nn: NamespaceName) -> Self { IdentityKey::from(&nn) }
}

impl From<&str> for IdentityKey {
    fn from(s: &str) -> Self { IdentityKey(s.trim_start_matches('/').to_string()) }
}

impl Borrow<str> for IdentityKey {
    fn borrow(&self) -> &str { &self.0 }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_scoped_key_is_bare_name() {
        assert_eq!(NamespaceName::cluster("node-1").key().as_str(), "node-1");
        assert_eq!(NamespaceName::new("ns1", "vm1").key().as_str(), "ns1/vm1");
    }

    #[test]
    fn key_round_trips_to_namespace_name() {
        let nn = NamespaceName::new("default", "web");
        assert_eq!(nn.key().namespace_name(), nn);
        assert_eq!(IdentityKey::from("node-1").namespace_name(), NamespaceName::cluster("node-1"));
        // leading slash from an empty namespace is normalised away
        assert_eq!(IdentityKey::from("/node-1"), NamespaceName::cluster("node-1").key());
    }
}

// Core data structures shared by the replicator and the supervisor

use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use url::Url;

// ============================================================================
// Node Identity
// ============================================================================

/// Identifier of a storage node in the fleet
///
/// Configuration and job payloads written by other fleet tools use either
/// JSON strings or JSON integers for ids, so both are accepted. Ids are
/// compared by their string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for NodeId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Integral ids go back out as integers
        match self.0.parse::<u64>() {
            Ok(n) if n.to_string() == self.0 => serializer.serialize_u64(n),
            _ => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeIdVisitor;

        impl Visitor<'_> for NodeIdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a node id as string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeId, E> {
                Ok(NodeId::from(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<NodeId, E> {
                Ok(NodeId(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<NodeId, E> {
                Ok(NodeId::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<NodeId, E> {
                Ok(NodeId(v.to_string()))
            }
        }

        deserializer.deserialize_any(NodeIdVisitor)
    }
}

/// Network address of a node or a queue backing server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Node Map
// ============================================================================

/// Errors raised when looking up nodes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeMapError {
    #[error("Unknown node id: {0}")]
    UnknownNode(NodeId),

    #[error("Invalid address for node {id}: {reason}")]
    InvalidAddress { id: NodeId, reason: String },
}

/// Immutable snapshot of the fleet: node id -> address
///
/// A new snapshot replaces the old one wholesale; nothing mutates a map
/// after it is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeMap {
    nodes: HashMap<NodeId, Endpoint>,
}

impl NodeMap {
    pub fn new(nodes: HashMap<NodeId, Endpoint>) -> Self {
        Self { nodes }
    }

    /// Parse the `/servers-map` document
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Endpoint> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Return the first id in `ids` missing from this map
    pub fn first_unknown<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> Option<&'a NodeId> {
        ids.into_iter().find(|id| !self.contains(id))
    }

    /// Build `http://host:port{path}` for a node
    pub fn resolve_url(&self, id: &NodeId, path: &str) -> Result<Url, NodeMapError> {
        let endpoint = self
            .get(id)
            .ok_or_else(|| NodeMapError::UnknownNode(id.clone()))?;

        let mut url = Url::parse(&format!("http://{}:{}", endpoint.host, endpoint.port)).map_err(
            |e| NodeMapError::InvalidAddress {
                id: id.clone(),
                reason: e.to_string(),
            },
        )?;
        url.set_path(path);

        Ok(url)
    }
}

impl FromIterator<(NodeId, Endpoint)> for NodeMap {
    fn from_iter<T: IntoIterator<Item = (NodeId, Endpoint)>>(iter: T) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

// ============================================================================
// Replication Job
// ============================================================================

/// A request to copy `path` from one of `from` to `to`
///
/// This is also the queue wire format: `{"from": [..], "to": .., "path": ".."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub from: Vec<NodeId>,
    pub to: NodeId,
    pub path: String,
}

impl ReplicationJob {
    pub fn new(from: Vec<NodeId>, to: NodeId, path: impl Into<String>) -> Self {
        Self {
            from,
            to,
            path: path.into(),
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// Pick one source uniformly at random
    pub fn choose_source<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&NodeId> {
        self.from.choose(rng)
    }
}

// ============================================================================
// Queue Descriptor
// ============================================================================

/// The `/queue` document: backing servers plus the queue key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub servers: Vec<Endpoint>,
    pub key: String,
}

impl QueueDescriptor {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

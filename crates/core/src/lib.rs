//! Skiff core types: resource keys, derived ids, kinds and service states.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod state;

pub use state::{ClusterStatusSnapshot, LogLevel, ServiceState};

/// Group used when a resource object carries no explicit `group`.
pub const DEFAULT_GROUP: &str = "default";

/// Namespace for name-based resource ids. Changing it changes every id.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x736b_6966_662d_6b65_7973_2d76_3500_0001);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("resource object is missing `{0}`")]
    MissingField(&'static str),
    #[error("resource object is not a JSON object")]
    NotAnObject,
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
    #[error("invalid status snapshot: {0}")]
    Snapshot(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Identifies one managed resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), name: name.into() }
    }

    /// Extract the key from any resource object. Field order in the object is irrelevant.
    pub fn from_value(v: &serde_json::Value) -> CoreResult<Self> {
        let obj = v.as_object().ok_or(CoreError::NotAnObject)?;
        let name = obj
            .get("name")
            .and_then(|n| n.as_str())
            .filter(|n| !n.is_empty())
            .ok_or(CoreError::MissingField("name"))?;
        let group = obj.get("group").and_then(|g| g.as_str()).unwrap_or(DEFAULT_GROUP);
        Ok(Self::new(group, name))
    }

    pub fn id(&self) -> ResourceId {
        get_id(self)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// Stable string id derived from (group, name); used as dedup key and entity index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deterministic id for a key: a v5 UUID over `group NUL name`.
///
/// The separator keeps `("a_b", "c")` and `("a", "b_c")` apart.
pub fn get_id(key: &ResourceKey) -> ResourceId {
    let mut buf = Vec::with_capacity(key.group.len() + key.name.len() + 1);
    buf.extend_from_slice(key.group.as_bytes());
    buf.push(0);
    buf.extend_from_slice(key.name.as_bytes());
    ResourceId(Uuid::new_v5(&ID_NAMESPACE, &buf).hyphenated().to_string())
}

/// Kinds of resources managed through the console API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Broker,
    Worker,
    Zookeeper,
    Topic,
    Connector,
    Pipeline,
    Workspace,
    Shabondi,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Broker,
        ResourceKind::Worker,
        ResourceKind::Zookeeper,
        ResourceKind::Topic,
        ResourceKind::Connector,
        ResourceKind::Pipeline,
        ResourceKind::Workspace,
        ResourceKind::Shabondi,
    ];

    /// Singular lower-case label, as used in titles ("broker").
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Broker => "broker",
            ResourceKind::Worker => "worker",
            ResourceKind::Zookeeper => "zookeeper",
            ResourceKind::Topic => "topic",
            ResourceKind::Connector => "connector",
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::Workspace => "workspace",
            ResourceKind::Shabondi => "shabondi",
        }
    }

    /// REST path segment; also the entity-table name.
    pub fn plural(self) -> &'static str {
        match self {
            ResourceKind::Broker => "brokers",
            ResourceKind::Worker => "workers",
            ResourceKind::Zookeeper => "zookeepers",
            ResourceKind::Topic => "topics",
            ResourceKind::Connector => "connectors",
            ResourceKind::Pipeline => "pipelines",
            ResourceKind::Workspace => "workspaces",
            ResourceKind::Shabondi => "shabondis",
        }
    }

    /// Kinds that run as services and therefore support start/stop.
    pub fn is_service(self) -> bool {
        !matches!(self, ResourceKind::Pipeline | ResourceKind::Workspace)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.label() == lower || k.plural() == lower)
            .ok_or_else(|| CoreError::UnknownKind(s.to_string()))
    }
}

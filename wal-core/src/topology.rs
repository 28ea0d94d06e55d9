//! Replica topology: which datacenters take part in consensus and how to reach them.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Number of distinct replica acknowledgements needed for a phase to succeed.
#[must_use]
pub const fn quorum(num_replicas: usize) -> usize {
    num_replicas / 2 + 1
}

/// Number of replica failures after which [`quorum`] can no longer be reached.
#[must_use]
pub const fn quorum_impossible(num_replicas: usize) -> usize {
    num_replicas - quorum(num_replicas) + 1
}

/// Network endpoint of one replication server.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    #[must_use]
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

impl FromStr for Host {
    type Err = Report<TopologyError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Report::new(TopologyError).attach(format!("missing port in {s:?}")))?;
        let port = port
            .parse()
            .change_context(TopologyError)
            .attach(format!("invalid port in {s:?}"))?;
        Ok(Self::new(name, port))
    }
}

/// One datacenter-level participant. All of its hosts serve the same replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDesc {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<Host>,
}

impl ReplicaDesc {
    #[must_use]
    pub fn new(name: impl Into<String>, hosts: impl IntoIterator<Item = Host>) -> Self {
        let mut seen = BTreeSet::new();
        let hosts = hosts
            .into_iter()
            .filter(|h| seen.insert(h.clone()))
            .collect();
        Self {
            name: name.into(),
            hosts,
        }
    }
}

#[derive(Deserialize)]
struct RawTopology {
    my_replica: String,
    replicas: Vec<ReplicaDesc>,
}

/// Validated replica set plus the designation of the local replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTopology")]
pub struct Topology {
    my_replica: String,
    replicas: Vec<ReplicaDesc>,
}

impl TryFrom<RawTopology> for Topology {
    type Error = Report<TopologyError>;

    fn try_from(raw: RawTopology) -> Result<Self, Self::Error> {
        Self::new(raw.my_replica, raw.replicas)
    }
}

impl Topology {
    /// # Errors
    /// Fails if replica names repeat, the local replica is missing, or a remote
    /// replica has no hosts.
    pub fn new(
        my_replica: impl Into<String>,
        replicas: impl IntoIterator<Item = ReplicaDesc>,
    ) -> Result<Self, Report<TopologyError>> {
        let my_replica = my_replica.into();
        let replicas: Vec<ReplicaDesc> = replicas
            .into_iter()
            .map(|r| ReplicaDesc::new(r.name, r.hosts))
            .collect();

        let mut names = BTreeSet::new();
        for replica in &replicas {
            if !names.insert(replica.name.as_str()) {
                return Err(Report::new(TopologyError)
                    .attach(format!("duplicate replica {:?}", replica.name)));
            }
            if replica.name != my_replica && replica.hosts.is_empty() {
                return Err(Report::new(TopologyError)
                    .attach(format!("replica {:?} has no hosts", replica.name)));
            }
        }
        if !names.contains(my_replica.as_str()) {
            return Err(Report::new(TopologyError)
                .attach(format!("local replica {my_replica:?} is not configured")));
        }

        Ok(Self {
            my_replica,
            replicas,
        })
    }

    /// # Errors
    /// Fails if the file cannot be read or does not describe a valid topology.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Report<TopologyError>> {
        let path = path.as_ref();
        let contents = std::fs::read(path)
            .change_context(TopologyError)
            .attach(format!("reading {}", path.display()))?;
        Self::from_json(&contents)
    }

    /// # Errors
    /// Fails if `json` does not describe a valid topology.
    pub fn from_json(json: &[u8]) -> Result<Self, Report<TopologyError>> {
        serde_json::from_slice(json)
            .change_context(TopologyError)
            .attach("parsing topology JSON")
    }

    #[must_use]
    pub fn my_replica(&self) -> &str {
        &self.my_replica
    }

    #[must_use]
    pub fn replicas(&self) -> &[ReplicaDesc] {
        &self.replicas
    }

    #[must_use]
    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Every replica except the local one.
    pub fn remote_replicas(&self) -> impl Iterator<Item = &ReplicaDesc> {
        self.replicas.iter().filter(|r| r.name != self.my_replica)
    }

    /// Every host of every remote replica, each paired with its replica.
    pub fn remote_hosts(&self) -> impl Iterator<Item = (&ReplicaDesc, &Host)> {
        self.remote_replicas()
            .flat_map(|r| r.hosts.iter().map(move |h| (r, h)))
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        quorum(self.num_replicas())
    }

    #[must_use]
    pub fn quorum_impossible(&self) -> usize {
        quorum_impossible(self.num_replicas())
    }
}

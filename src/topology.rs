//! Cluster topology types and the external collaborators that observe it.
//!
//! The affinity function and the membership service are both external to
//! this crate (see `AffinityOracle` and `TopologyEvents` below); this module
//! only fixes the shapes the streamer routes and remaps against.

use std::cmp::Ordering;
use std::fmt;
use std::pin::Pin;

use futures::Stream;

/// Opaque, globally-unique node identifier.
pub type NodeId = String;

/// A monotonically increasing tuple identifying a cluster membership
/// snapshot. The affinity function is a pure function of
/// `(cache, key, topology_version)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TopologyVersion {
    pub major: u64,
    pub minor: u32,
}

impl TopologyVersion {
    pub const ZERO: TopologyVersion = TopologyVersion { major: 0, minor: 0 };

    pub fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn next_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }
}

impl Ord for TopologyVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl PartialOrd for TopologyVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Pure mapping from a key to its owning nodes at a given topology version.
///
/// Implementations must return a stable answer for a fixed
/// `(cache, key, topology_version)` triple; this crate never caches affinity
/// results itself.
pub trait AffinityOracle: Send + Sync + 'static {
    /// Primary followed by backups, in replication order. Empty means the
    /// key currently maps to no node (topology-empty).
    fn map_primary_and_backups(
        &self,
        cache: &str,
        key: &[u8],
        version: TopologyVersion,
    ) -> Vec<NodeId>;

    /// Just the primary, for `allow_overwrite = true` routing.
    fn map_primary(&self, cache: &str, key: &[u8], version: TopologyVersion) -> Option<NodeId> {
        self.map_primary_and_backups(cache, key, version)
            .into_iter()
            .next()
    }

    /// The most recent topology version this oracle has applied.
    fn ready_version(&self) -> TopologyVersion;

    /// Resolves once `ready_version() >= version`. Used by the topology
    /// listener to avoid remapping against a stale view (see
    /// `TopologyListener`).
    fn wait_ready<'a>(
        &'a self,
        version: TopologyVersion,
    ) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>>;
}

/// A node-join/leave notification from the membership service, carrying the
/// topology version at which it was observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    NodeFailed {
        node_id: NodeId,
        version: TopologyVersion,
    },
    NodeLeft {
        node_id: NodeId,
        version: TopologyVersion,
    },
    /// The client has been detached from the cluster entirely.
    Disconnected,
}

impl TopologyEvent {
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            TopologyEvent::NodeFailed { node_id, .. } | TopologyEvent::NodeLeft { node_id, .. } => {
                Some(node_id)
            }
            TopologyEvent::Disconnected => None,
        }
    }

    pub fn version(&self) -> Option<TopologyVersion> {
        match self {
            TopologyEvent::NodeFailed { version, .. } | TopologyEvent::NodeLeft { version, .. } => {
                Some(*version)
            }
            TopologyEvent::Disconnected => None,
        }
    }
}

/// Boxed stream of membership events, the shape the topology listener
/// consumes. Kept as a type alias so callers don't need to name the
/// underlying subscription type.
pub type TopologyEventStream = Pin<Box<dyn Stream<Item = TopologyEvent> + Send>>;

/// The membership service collaborator: subscribes to node departures and
/// disconnects. External to this crate; see `PURPOSE & SCOPE`.
pub trait TopologyEvents: Send + Sync + 'static {
    fn subscribe(&self) -> TopologyEventStream;
}

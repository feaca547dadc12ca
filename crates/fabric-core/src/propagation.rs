//! Propagation statistics and strength grading
//!
//! Aggregates how many configured relays and servers hold each file into a
//! coverage figure and a discrete strength grade. Everything here is a pure
//! function of its inputs; callers recompute after every status change.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{DeploymentFileStatus, RemoteFileRecord};

/// Discrete health grade, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Broken,
    Fragile,
    Weak,
    Average,
    Strong,
    Nominal,
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Broken => "broken",
            Self::Fragile => "fragile",
            Self::Weak => "weak",
            Self::Average => "average",
            Self::Strong => "strong",
            Self::Nominal => "nominal",
        };
        f.write_str(name)
    }
}

/// Which half of the fabric a statistic describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Relay,
    Server,
}

/// Confirmed presence of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilePresence {
    pub relays: usize,
    pub servers: usize,
}

impl FilePresence {
    pub fn new(relays: usize, servers: usize) -> Self {
        Self { relays, servers }
    }

    /// Count the configured nodes present in the given origin sets.
    ///
    /// Origins outside the configured node lists are not counted, so coverage
    /// never exceeds the node count.
    pub fn from_sets<'a>(
        relay_origins: impl IntoIterator<Item = &'a str>,
        server_origins: impl IntoIterator<Item = &'a str>,
        relays: &[String],
        servers: &[String],
    ) -> Self {
        let relay_set: BTreeSet<&str> = relay_origins.into_iter().collect();
        let server_set: BTreeSet<&str> = server_origins.into_iter().collect();
        Self {
            relays: relays.iter().filter(|r| relay_set.contains(r.as_str())).count(),
            servers: servers.iter().filter(|s| server_set.contains(s.as_str())).count(),
        }
    }

    /// Presence of a discovered record.
    pub fn from_record(record: &RemoteFileRecord, relays: &[String], servers: &[String]) -> Self {
        Self::from_sets(
            record.relays.iter().map(String::as_str),
            record.servers.iter().map(String::as_str),
            relays,
            servers,
        )
    }

    /// Presence of a run entry, merged with what discovery already confirmed.
    pub fn from_run(
        status: &DeploymentFileStatus,
        remote: Option<&RemoteFileRecord>,
        relays: &[String],
        servers: &[String],
    ) -> Self {
        let remote_relays = remote.into_iter().flat_map(|r| r.relays.iter().map(String::as_str));
        let remote_servers = remote.into_iter().flat_map(|r| r.servers.iter().map(String::as_str));
        Self::from_sets(
            status.published_relays().chain(remote_relays),
            status.completed_servers().chain(remote_servers),
            relays,
            servers,
        )
    }

    fn count(&self, kind: NetworkKind) -> usize {
        match kind {
            NetworkKind::Relay => self.relays,
            NetworkKind::Server => self.servers,
        }
    }
}

/// Propagation figures for one network kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub kind: NetworkKind,
    pub nodes: usize,
    /// Files present on every node
    pub fully_propagated: usize,
    /// Mean number of nodes holding a file
    pub average_coverage: f64,
    /// `average_coverage / nodes * 100`
    pub propagation_percentage: f64,
    pub strength: Strength,
}

impl NetworkStats {
    fn compute(kind: NetworkKind, files: &[FilePresence], nodes: usize) -> Self {
        let average_coverage = if files.is_empty() {
            0.0
        } else {
            let total: usize = files.iter().map(|f| f.count(kind)).sum();
            total as f64 / files.len() as f64
        };
        let propagation_percentage = if nodes == 0 {
            0.0
        } else {
            average_coverage / nodes as f64 * 100.0
        };
        let fully_propagated = if nodes == 0 {
            0
        } else {
            files.iter().filter(|f| f.count(kind) >= nodes).count()
        };

        Self {
            kind,
            nodes,
            fully_propagated,
            average_coverage,
            propagation_percentage,
            strength: classify_strength(kind, nodes, propagation_percentage),
        }
    }
}

/// Grade a network from its node count and propagation percentage.
pub fn classify_strength(kind: NetworkKind, nodes: usize, percentage: f64) -> Strength {
    match (kind, nodes) {
        (_, 0) => Strength::Broken,
        (_, 1) => Strength::Fragile,
        (NetworkKind::Relay, 2) => Strength::Weak,
        (NetworkKind::Server, n) if n < 3 => Strength::Weak,
        (_, n) if n >= 3 && percentage >= 100.0 => Strength::Nominal,
        (NetworkKind::Relay, n) if n >= 5 && percentage > 95.0 => Strength::Strong,
        (NetworkKind::Server, n) if n >= 3 && percentage > 95.0 => Strength::Strong,
        _ => Strength::Average,
    }
}

/// Propagation across both networks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PropagationStats {
    pub files: usize,
    pub relays: NetworkStats,
    pub servers: NetworkStats,
}

impl PropagationStats {
    /// The weaker of the relay and server grades.
    pub fn overall(&self) -> Strength {
        self.relays.strength.min(self.servers.strength)
    }
}

impl Default for PropagationStats {
    fn default() -> Self {
        compute(&[], 0, 0)
    }
}

/// Compute propagation statistics for a file set.
pub fn compute(files: &[FilePresence], total_relays: usize, total_servers: usize) -> PropagationStats {
    PropagationStats {
        files: files.len(),
        relays: NetworkStats::compute(NetworkKind::Relay, files, total_relays),
        servers: NetworkStats::compute(NetworkKind::Server, files, total_servers),
    }
}

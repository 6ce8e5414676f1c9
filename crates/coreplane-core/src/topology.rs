//! # CPU Topology Model
//!
//! Immutable description of the machine: which core, socket, and NUMA node
//! every CPU belongs to, plus derived set-algebra views over those ID spaces.
//!
//! [`CpuTopology`] is built once (usually via [`crate::discover`]) and shared
//! read-only for the life of the process. [`CpuDetails`] is the underlying
//! CPU → placement map; the allocator re-uses the same type for its shrinking
//! "still available" view, so both sides answer the same queries.

use std::collections::BTreeMap;

use crate::cpuset::CpuSet;

/// Errors from topology construction and discovery.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// The supplied CPU records do not describe a consistent machine.
    #[error("malformed topology: {0}")]
    Malformed(String),

    /// Reading the platform topology failed.
    #[error("topology detection failed: {0}")]
    Detection(String),
}

/// Placement of a single CPU: its core, socket, and NUMA node.
///
/// CPU IDs are platform-assigned and treated as opaque keys; they are dense
/// but not necessarily contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDetail {
    /// Logical CPU (hardware thread) ID.
    pub cpu_id: usize,
    /// Physical core hosting this CPU.
    pub core_id: usize,
    /// Physical package hosting the core.
    pub socket_id: usize,
    /// Memory-affinity domain of the core.
    pub numa_node_id: usize,
}

/// Map from CPU ID to placement, with derived views.
///
/// Every view is pure and returns an owned [`CpuSet`]; nothing here mutates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuDetails(BTreeMap<usize, CpuDetail>);

impl CpuDetails {
    fn from_records(records: &[CpuDetail]) -> Self {
        Self(records.iter().map(|d| (d.cpu_id, *d)).collect())
    }

    /// Placement of `cpu`, if present.
    #[must_use]
    pub fn get(&self, cpu: usize) -> Option<&CpuDetail> {
        self.0.get(&cpu)
    }

    /// All CPU IDs in the map.
    #[must_use]
    pub fn cpus(&self) -> CpuSet {
        self.0.keys().copied().collect()
    }

    /// Distinct socket IDs.
    #[must_use]
    pub fn sockets(&self) -> CpuSet {
        self.0.values().map(|d| d.socket_id).collect()
    }

    /// Distinct core IDs.
    #[must_use]
    pub fn cores(&self) -> CpuSet {
        self.0.values().map(|d| d.core_id).collect()
    }

    /// Distinct NUMA node IDs.
    #[must_use]
    pub fn numa_nodes(&self) -> CpuSet {
        self.0.values().map(|d| d.numa_node_id).collect()
    }

    /// CPU IDs on socket `socket`.
    #[must_use]
    pub fn cpus_in_socket(&self, socket: usize) -> CpuSet {
        self.0
            .values()
            .filter(|d| d.socket_id == socket)
            .map(|d| d.cpu_id)
            .collect()
    }

    /// Core IDs on socket `socket`.
    #[must_use]
    pub fn cores_in_socket(&self, socket: usize) -> CpuSet {
        self.0
            .values()
            .filter(|d| d.socket_id == socket)
            .map(|d| d.core_id)
            .collect()
    }

    /// CPU IDs on core `core`.
    #[must_use]
    pub fn cpus_in_core(&self, core: usize) -> CpuSet {
        self.0
            .values()
            .filter(|d| d.core_id == core)
            .map(|d| d.cpu_id)
            .collect()
    }

    /// CPU IDs on any of the given NUMA nodes.
    #[must_use]
    pub fn cpus_in_numa_nodes(&self, nodes: &[usize]) -> CpuSet {
        self.0
            .values()
            .filter(|d| nodes.contains(&d.numa_node_id))
            .map(|d| d.cpu_id)
            .collect()
    }

    /// Socket IDs with at least one CPU on any of the given NUMA nodes.
    #[must_use]
    pub fn sockets_in_numa_nodes(&self, nodes: &[usize]) -> CpuSet {
        self.0
            .values()
            .filter(|d| nodes.contains(&d.numa_node_id))
            .map(|d| d.socket_id)
            .collect()
    }

    /// Returns a copy restricted to the CPUs in `keep`.
    #[must_use]
    pub fn keep_only(&self, keep: &CpuSet) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(cpu, _)| keep.contains(**cpu))
                .map(|(cpu, d)| (*cpu, *d))
                .collect(),
        )
    }
}

/// Immutable machine topology with cached per-socket and per-core CPU counts.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    details: CpuDetails,
    num_cpus: usize,
    cpus_per_socket: usize,
    cpus_per_core: usize,
}

impl CpuTopology {
    /// Builds a topology from per-CPU placement records.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Malformed`] when the records are empty,
    /// repeat a CPU ID, split a core across sockets or NUMA nodes, or when
    /// CPUs do not divide evenly over sockets or cores.
    pub fn new(records: Vec<CpuDetail>) -> Result<Self, TopologyError> {
        if records.is_empty() {
            return Err(TopologyError::Malformed("no cpus".into()));
        }

        let mut seen = CpuSet::new();
        let mut core_homes: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for d in &records {
            if seen.contains(d.cpu_id) {
                return Err(TopologyError::Malformed(format!(
                    "duplicate cpu id {}",
                    d.cpu_id
                )));
            }
            seen.insert(d.cpu_id);

            let home = (d.socket_id, d.numa_node_id);
            if let Some(prev) = core_homes.insert(d.core_id, home) {
                if prev != home {
                    return Err(TopologyError::Malformed(format!(
                        "core {} spans socket/numa boundaries",
                        d.core_id
                    )));
                }
            }
        }

        let details = CpuDetails::from_records(&records);
        let num_cpus = records.len();
        let num_sockets = details.sockets().len();
        let num_cores = details.cores().len();

        if num_cpus % num_sockets != 0 {
            return Err(TopologyError::Malformed(format!(
                "{num_cpus} cpus do not divide evenly over {num_sockets} sockets"
            )));
        }
        if num_cpus % num_cores != 0 {
            return Err(TopologyError::Malformed(format!(
                "{num_cpus} cpus do not divide evenly over {num_cores} cores"
            )));
        }

        Ok(Self {
            details,
            num_cpus,
            cpus_per_socket: num_cpus / num_sockets,
            cpus_per_core: num_cpus / num_cores,
        })
    }

    /// The full CPU → placement map.
    #[must_use]
    pub fn details(&self) -> &CpuDetails {
        &self.details
    }

    /// Total CPU count.
    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Hardware threads per socket.
    #[must_use]
    pub fn cpus_per_socket(&self) -> usize {
        self.cpus_per_socket
    }

    /// Hardware threads per core.
    #[must_use]
    pub fn cpus_per_core(&self) -> usize {
        self.cpus_per_core
    }

    /// One-line description of the machine, for startup logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} cpus over {} sockets, {} cores, {} numa nodes",
            self.num_cpus,
            self.details.sockets().len(),
            self.details.cores().len(),
            self.details.numa_nodes().len()
        )
    }
}

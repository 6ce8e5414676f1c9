//! # Coreplane Core
//!
//! Topology-aware CPU allocation for a node-level container runtime.
//!
//! Given a machine's CPU topology (sockets, cores, hardware threads, NUMA
//! nodes), a set of currently-available CPU IDs, and a requested count, the
//! allocator selects exactly that many CPUs while minimising cross-socket
//! and cross-core fragmentation, optionally biased toward a preferred
//! socket. The hint generator enumerates candidate NUMA affinity masks for
//! the same request so an outer topology coordinator can align CPU
//! placement with memory and device affinity.
//!
//! ## Components
//!
//! - [`CpuSet`] - Ordered CPU-ID sets with deterministic iteration
//! - [`CpuTopology`] - Immutable machine description and derived views
//! - [`take_by_topology`] - Five-phase best-fit CPU selection
//! - [`HintGenerator`] - NUMA affinity mask enumeration with preferred marking
//! - [`discover`](discover::discover) - sysfs topology detection with fallback
//!
//! ## Example
//!
//! ```rust,ignore
//! use coreplane_core::{discover, take_by_topology, HintGenerator};
//!
//! let topo = discover::discover()?;
//! let available = topo.details().cpus();
//!
//! // Reserve 4 CPUs, preferring socket 0.
//! let cpus = take_by_topology(&topo, &available, 4, Some(0))?;
//!
//! // Candidate NUMA affinities for the same request.
//! let hints = HintGenerator::new(&topo).generate_hints(&available, 4);
//! ```
//!
//! ## Design Principles
//!
//! 1. **Pure functions over snapshots** - same inputs, same answer, every time
//! 2. **Determinism everywhere** - every enumeration has a documented order
//! 3. **Preference biases, never vetoes** - a feasible request always succeeds
//! 4. **No locking** - the topology is immutable; callers serialise allocations

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod allocator;
pub mod cpuset;
pub mod discover;
pub mod hints;
pub mod topology;

pub use allocator::{take_by_topology, AllocError};
pub use cpuset::CpuSet;
pub use hints::{HintGenerator, NodeMask, TopologyHint};
pub use topology::{CpuDetail, CpuTopology, TopologyError};

/// Result type for coreplane-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for coreplane-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Topology construction or discovery errors
    #[error("topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    /// CPU allocation errors
    #[error("allocation error: {0}")]
    Alloc(#[from] allocator::AllocError),

    /// NUMA node mask errors
    #[error("node mask error: {0}")]
    Mask(#[from] hints::NodeMaskError),
}

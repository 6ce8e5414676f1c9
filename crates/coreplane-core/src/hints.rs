//! # NUMA Topology Hints
//!
//! Enumerates candidate NUMA affinity masks for a CPU request so an outer
//! topology coordinator can reconcile CPU placement with other resources
//! (memory, devices).
//!
//! A hint is a `(mask, preferred)` pair. Every mask with enough available
//! CPUs to satisfy the request becomes a hint; the post-pass then marks as
//! *preferred* exactly the hints that are as narrow as any feasible mask can
//! be, both in node count and in the number of sockets the mask spans.
//!
//! The pinning variant seeds a single mask at a caller-preferred node and
//! grows it over the remaining nodes in ascending ID order until the request
//! fits, emitting at most one hint.

use std::collections::HashMap;

use crate::cpuset::CpuSet;
use crate::topology::CpuTopology;

/// Pod annotation naming the preferred NUMA node for CPU placement.
pub const PREFERRED_NUMA_NODE_ANNOTATION: &str = "PreferredNUMANodeId";

/// Resource name hints are keyed under in the hint map.
pub const RESOURCE_CPU: &str = "cpu";

/// Errors from building a [`NodeMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NodeMaskError {
    /// Node ID does not fit the 64-bit mask.
    #[error("numa node {0} out of mask range")]
    OutOfRange(usize),
}

/// Bit set over NUMA node IDs 0..64.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeMask(u64);

impl NodeMask {
    /// Largest node ID a mask can hold, exclusive.
    pub const MAX_NODES: usize = 64;

    /// Creates an empty mask.
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Creates a mask with the given nodes set.
    ///
    /// # Errors
    ///
    /// [`NodeMaskError::OutOfRange`] if any ID is 64 or larger.
    pub fn from_nodes(nodes: &[usize]) -> Result<Self, NodeMaskError> {
        let mut mask = Self::new();
        for &node in nodes {
            mask.add(node)?;
        }
        Ok(mask)
    }

    /// Sets `node` in the mask.
    ///
    /// # Errors
    ///
    /// [`NodeMaskError::OutOfRange`] if the ID is 64 or larger.
    pub fn add(&mut self, node: usize) -> Result<(), NodeMaskError> {
        if node >= Self::MAX_NODES {
            return Err(NodeMaskError::OutOfRange(node));
        }
        self.0 |= 1 << node;
        Ok(())
    }

    fn set_unchecked(&mut self, node: usize) {
        self.0 |= 1 << node;
    }

    /// Number of nodes set.
    #[must_use]
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether `node` is set.
    #[must_use]
    pub fn is_set(&self, node: usize) -> bool {
        node < Self::MAX_NODES && self.0 & (1 << node) != 0
    }

    /// The set node IDs, ascending.
    #[must_use]
    pub fn nodes(&self) -> Vec<usize> {
        (0..Self::MAX_NODES).filter(|&n| self.is_set(n)).collect()
    }
}

/// A candidate NUMA affinity for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyHint {
    /// NUMA nodes the CPUs may come from.
    pub numa_affinity: NodeMask,
    /// Whether this affinity is as narrow as any feasible one.
    pub preferred: bool,
}

/// Calls `f` with every non-empty subset of `domain` as a [`NodeMask`].
///
/// Subsets are visited in ascending order of their index bitmap over the
/// sorted, deduplicated domain, so singletons of low IDs come first and the
/// full domain comes last. The order is deterministic for a given domain.
///
/// IDs that do not fit a mask are dropped from the domain with a warning.
/// The walk is exponential in the domain size; callers bound node counts.
pub fn iterate_node_masks(domain: &[usize], mut f: impl FnMut(NodeMask)) {
    let mut nodes: Vec<usize> = domain
        .iter()
        .copied()
        .filter(|&n| {
            let fits = n < NodeMask::MAX_NODES;
            if !fits {
                tracing::warn!("numa node {n} does not fit a node mask, skipping");
            }
            fits
        })
        .collect();
    nodes.sort_unstable();
    nodes.dedup();

    for bits in 1u128..(1u128 << nodes.len()) {
        let mut mask = NodeMask::new();
        for (i, &node) in nodes.iter().enumerate() {
            if bits & (1u128 << i) != 0 {
                mask.set_unchecked(node);
            }
        }
        f(mask);
    }
}

/// Parses the preferred-NUMA-node pod annotation.
///
/// Returns `None` when the annotation is absent, negative (the "no
/// preference" sentinel), or unparseable.
#[must_use]
pub fn preferred_numa_node(annotations: &HashMap<String, String>) -> Option<usize> {
    let value = annotations.get(PREFERRED_NUMA_NODE_ANNOTATION)?;
    match value.trim().parse::<i64>() {
        Ok(id) if id >= 0 => usize::try_from(id).ok(),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(
                "ignoring unparseable {PREFERRED_NUMA_NODE_ANNOTATION} annotation {value:?}: {err}"
            );
            None
        }
    }
}

/// Generates NUMA affinity hints for CPU requests against one topology.
pub struct HintGenerator<'a> {
    topo: &'a CpuTopology,
}

impl<'a> HintGenerator<'a> {
    /// Creates a generator over `topo`.
    #[must_use]
    pub fn new(topo: &'a CpuTopology) -> Self {
        Self { topo }
    }

    /// Enumerates every NUMA mask with at least `request` available CPUs.
    ///
    /// Cannot fail; an empty result means no mask satisfies the request.
    #[must_use]
    pub fn generate_hints(&self, available: &CpuSet, request: usize) -> Vec<TopologyHint> {
        let domain = self.topo.details().numa_nodes().to_vec();
        self.enumerate(available, request, &domain)
    }

    /// Variant honouring a caller-preferred node.
    ///
    /// With `pinning` set (and a preference present), a single hint is
    /// seeded at `pref` and grown over the remaining nodes in ascending ID
    /// order until the request fits; nothing is emitted if even the full
    /// machine cannot fit it. Without `pinning`, this enumerates like
    /// [`Self::generate_hints`] but over `numa_nodes \ {pref}`, so no hint
    /// ever mentions the preferred node.
    #[must_use]
    pub fn generate_hints_pinning(
        &self,
        available: &CpuSet,
        request: usize,
        pref: Option<usize>,
        pinning: bool,
    ) -> Vec<TopologyHint> {
        let all = self.topo.details().numa_nodes();
        let domain: Vec<usize> = match pref {
            Some(p) => all.filter(|n| n != p).to_vec(),
            None => all.to_vec(),
        };

        let (Some(pref), true) = (pref, pinning) else {
            return self.enumerate(available, request, &domain);
        };

        let mut mask = match NodeMask::from_nodes(&[pref]) {
            Ok(mask) => mask,
            Err(err) => {
                tracing::warn!("cannot pin to numa node {pref}: {err}");
                return Vec::new();
            }
        };

        let mut num_matching = self.matching_cpus(available, &[pref]);
        if num_matching < request {
            for node in domain {
                if mask.add(node).is_err() {
                    continue;
                }
                num_matching += self.matching_cpus(available, &[node]);
                if num_matching >= request {
                    break;
                }
            }
        }
        if num_matching < request {
            return Vec::new();
        }

        let mut hints = vec![TopologyHint {
            numa_affinity: mask,
            preferred: false,
        }];
        let min_sockets = self
            .topo
            .details()
            .sockets_in_numa_nodes(&mask.nodes())
            .len();
        self.mark_preferred(&mut hints, mask.count(), min_sockets);
        hints
    }

    /// Hints for the `"cpu"` resource, in the map shape the topology
    /// coordinator merges. Pinning is active exactly when a preference is
    /// present. A zero request produces no hints.
    #[must_use]
    pub fn resource_hints(
        &self,
        available: &CpuSet,
        request: usize,
        pref: Option<usize>,
    ) -> HashMap<String, Vec<TopologyHint>> {
        if request == 0 {
            return HashMap::new();
        }
        let hints = self.generate_hints_pinning(available, request, pref, pref.is_some());
        tracing::debug!(
            "generated {} cpu topology hints for request of {request}",
            hints.len()
        );
        HashMap::from([(RESOURCE_CPU.to_string(), hints)])
    }

    fn enumerate(&self, available: &CpuSet, request: usize, domain: &[usize]) -> Vec<TopologyHint> {
        let details = self.topo.details();
        let mut min_affinity_size = details.numa_nodes().len();
        let mut min_sockets_on_min_affinity = details.sockets().len();
        let mut hints = Vec::new();

        iterate_node_masks(domain, |mask| {
            let nodes = mask.nodes();
            let cpus_in_mask = details.cpus_in_numa_nodes(&nodes).len();
            let sockets_in_mask = details.sockets_in_numa_nodes(&nodes).len();
            if cpus_in_mask >= request && mask.count() < min_affinity_size {
                min_affinity_size = mask.count();
                if sockets_in_mask < min_sockets_on_min_affinity {
                    min_sockets_on_min_affinity = sockets_in_mask;
                }
            }

            let num_matching = available
                .iter()
                .filter(|&cpu| details.get(cpu).is_some_and(|d| mask.is_set(d.numa_node_id)))
                .count();
            if num_matching >= request {
                hints.push(TopologyHint {
                    numa_affinity: mask,
                    preferred: false,
                });
            }
        });

        self.mark_preferred(&mut hints, min_affinity_size, min_sockets_on_min_affinity);
        hints
    }

    /// Flips `preferred` on every hint whose mask is minimal both in node
    /// count and in sockets spanned.
    fn mark_preferred(
        &self,
        hints: &mut [TopologyHint],
        min_affinity_size: usize,
        min_sockets_on_min_affinity: usize,
    ) {
        for hint in hints {
            if hint.numa_affinity.count() == min_affinity_size {
                let sockets = self
                    .topo
                    .details()
                    .sockets_in_numa_nodes(&hint.numa_affinity.nodes())
                    .len();
                if sockets == min_sockets_on_min_affinity {
                    hint.preferred = true;
                }
            }
        }
    }

    fn matching_cpus(&self, available: &CpuSet, nodes: &[usize]) -> usize {
        available
            .iter()
            .filter(|&cpu| {
                self.topo
                    .details()
                    .get(cpu)
                    .is_some_and(|d| nodes.contains(&d.numa_node_id))
            })
            .count()
    }
}

//! # Topology-Aware CPU Allocation
//!
//! Picks exactly N CPUs out of an available set so that the pick fragments
//! sockets and cores as little as possible, optionally biased toward a
//! preferred socket.
//!
//! The policy is best-fit over three granularities, coarsest first:
//!
//! 1. whole sockets (preferred socket first, when free),
//! 2. whole cores on the preferred socket, then whole cores anywhere,
//! 3. single CPUs, preferred socket first, filling partially-consumed
//!    cores and sockets before breaking into fresh ones.
//!
//! The preference only reorders candidates; it never makes an otherwise
//! feasible request fail.

use std::cmp::Reverse;

use crate::cpuset::CpuSet;
use crate::topology::{CpuDetails, CpuTopology};

/// Errors from [`take_by_topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The available set is smaller than the request.
    #[error("not enough cpus available to satisfy request")]
    NotEnoughCpus,

    /// The phase walk ended with CPUs still owed. Unreachable when the
    /// up-front feasibility check passed; reported rather than asserted.
    #[error("failed to allocate cpus")]
    AllocationFailed,
}

/// Mutable cursor for one allocation call.
///
/// `details` starts as the topology view restricted to the caller's
/// available set and shrinks as CPUs move into `result`. The two are
/// disjoint at all times, and `result.len() + num_needed` equals the
/// original request.
struct CpuAccumulator<'a> {
    topo: &'a CpuTopology,
    details: CpuDetails,
    result: CpuSet,
    num_needed: usize,
}

impl<'a> CpuAccumulator<'a> {
    fn new(topo: &'a CpuTopology, available: &CpuSet, num_cpus: usize) -> Self {
        Self {
            topo,
            details: topo.details().keep_only(available),
            result: CpuSet::new(),
            num_needed: num_cpus,
        }
    }

    /// Every CPU of `socket` is still available.
    fn is_socket_free(&self, socket: usize) -> bool {
        self.details.cpus_in_socket(socket).len() == self.topo.cpus_per_socket()
    }

    /// Every CPU of `core` is still available.
    fn is_core_free(&self, core: usize) -> bool {
        self.details.cpus_in_core(core).len() == self.topo.cpus_per_core()
    }

    fn needs(&self, count: usize) -> bool {
        self.num_needed >= count
    }

    fn is_satisfied(&self) -> bool {
        self.num_needed == 0
    }

    fn is_failed(&self) -> bool {
        self.details.cpus().len() < self.num_needed
    }

    /// Moves `cpus` from the available view into the result.
    fn take(&mut self, cpus: &CpuSet) {
        debug_assert!(cpus.is_subset(&self.details.cpus()));
        self.result = self.result.union(cpus);
        self.details = self.details.keep_only(&self.details.cpus().difference(cpus));
        self.num_needed -= cpus.len();
    }

    /// Fully-free sockets, ascending by ID. When `pref` names a free
    /// socket it is moved to the front and the rest stay ascending.
    fn free_sockets(&self, pref: Option<usize>) -> Vec<usize> {
        let sockets = self
            .details
            .sockets()
            .filter(|s| self.is_socket_free(s))
            .to_vec();
        match pref {
            Some(p) if sockets.contains(&p) => {
                let mut ordered = vec![p];
                ordered.extend(sockets.into_iter().filter(|&s| s != p));
                ordered
            }
            _ => sockets,
        }
    }

    fn core_socket(&self, core: usize) -> usize {
        self.topo
            .details()
            .cpus_in_core(core)
            .iter()
            .next()
            .and_then(|cpu| self.topo.details().get(cpu))
            .map_or(0, |d| d.socket_id)
    }

    /// Sorts cores by the best-fit composite key: most result CPUs already
    /// on the core's socket first, then fewest available CPUs left on the
    /// socket, then fewest available CPUs left on the core, then socket and
    /// core ID ascending.
    fn sort_cores(&self, cores: &CpuSet) -> Vec<usize> {
        let mut cores = cores.to_vec();
        cores.sort_by_key(|&core| {
            let socket = self.core_socket(core);
            let socket_coloc = self
                .topo
                .details()
                .cpus_in_socket(socket)
                .intersection(&self.result)
                .len();
            let socket_free = self.details.cpus_in_socket(socket).len();
            let core_free = self.details.cpus_in_core(core).len();
            (Reverse(socket_coloc), socket_free, core_free, socket, core)
        });
        cores
    }

    /// Fully-free cores in composite order.
    fn free_cores(&self) -> Vec<usize> {
        self.sort_cores(&self.details.cores().filter(|c| self.is_core_free(c)))
    }

    /// Every available CPU: cores in composite order, each expanded to its
    /// available CPUs ascending.
    fn free_cpus(&self) -> Vec<usize> {
        self.expand(&self.sort_cores(&self.details.cores()))
    }

    /// Every available CPU with socket `pref` promoted to the front: the
    /// preferred socket's cores in composite order first, the remaining
    /// cores in composite order after them.
    fn free_cpus_preferred(&self, pref: usize) -> Vec<usize> {
        let preferred = self.details.cores_in_socket(pref);
        let rest = self.details.cores().difference(&preferred);
        let mut cpus = self.expand(&self.sort_cores(&preferred));
        cpus.extend(self.expand(&self.sort_cores(&rest)));
        cpus
    }

    fn expand(&self, cores: &[usize]) -> Vec<usize> {
        cores
            .iter()
            .flat_map(|&core| self.details.cpus_in_core(core).to_vec())
            .collect()
    }
}

/// Selects exactly `num_cpus` CPUs from `available`, minimising socket and
/// core fragmentation, preferring `preferred_socket` when given.
///
/// The result is a pure function of the inputs: the same topology,
/// available set, count, and preference always yield the same set.
///
/// # Errors
///
/// [`AllocError::NotEnoughCpus`] when fewer than `num_cpus` of `available`
/// exist in the topology; [`AllocError::AllocationFailed`] on the defensive
/// fallthrough after all phases.
pub fn take_by_topology(
    topo: &CpuTopology,
    available: &CpuSet,
    num_cpus: usize,
    preferred_socket: Option<usize>,
) -> Result<CpuSet, AllocError> {
    let mut acc = CpuAccumulator::new(topo, available, num_cpus);
    if acc.is_satisfied() {
        return Ok(acc.result);
    }
    if acc.is_failed() {
        return Err(AllocError::NotEnoughCpus);
    }

    // 1. Whole sockets, preferred socket first when it is free.
    for socket in acc.free_sockets(preferred_socket) {
        if acc.needs(topo.cpus_per_socket()) {
            if Some(socket) == preferred_socket {
                tracing::debug!("claiming preferred socket {socket}");
            } else {
                tracing::debug!("claiming socket {socket}");
            }
            let cpus = acc.details.cpus_in_socket(socket);
            acc.take(&cpus);
            if acc.is_satisfied() {
                return Ok(acc.result);
            }
        }
    }

    // 2. Whole cores on the preferred socket, ascending core ID.
    if let Some(pref) = preferred_socket {
        let cores = acc
            .details
            .cores_in_socket(pref)
            .filter(|c| acc.is_core_free(c))
            .to_vec();
        for core in cores {
            if acc.needs(topo.cpus_per_core()) {
                tracing::debug!("claiming core {core} on preferred socket {pref}");
                let cpus = acc.details.cpus_in_core(core);
                acc.take(&cpus);
                if acc.is_satisfied() {
                    return Ok(acc.result);
                }
            }
        }
    }

    // 3. Whole cores anywhere, best-fit order.
    for core in acc.free_cores() {
        if acc.needs(topo.cpus_per_core()) {
            tracing::debug!("claiming core {core}");
            let cpus = acc.details.cpus_in_core(core);
            acc.take(&cpus);
            if acc.is_satisfied() {
                return Ok(acc.result);
            }
        }
    }

    // 4. Single CPUs, preferred socket promoted to the front.
    if let Some(pref) = preferred_socket {
        for cpu in acc.free_cpus_preferred(pref) {
            if acc.needs(1) {
                tracing::trace!("claiming cpu {cpu}");
                acc.take(&CpuSet::from_slice(&[cpu]));
            }
            if acc.is_satisfied() {
                return Ok(acc.result);
            }
        }
    }

    // 5. Single CPUs anywhere.
    for cpu in acc.free_cpus() {
        if acc.needs(1) {
            tracing::trace!("claiming cpu {cpu}");
            acc.take(&CpuSet::from_slice(&[cpu]));
        }
        if acc.is_satisfied() {
            return Ok(acc.result);
        }
    }

    Err(AllocError::AllocationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::fixtures::{dual_socket_ht, single_socket_ht};

    fn set(ids: &[usize]) -> CpuSet {
        CpuSet::from_slice(ids)
    }

    #[test]
    fn test_free_sockets_ordering() {
        let single = single_socket_ht();
        let dual = dual_socket_ht();
        let cases: Vec<(&str, &CpuTopology, CpuSet, Option<usize>, Vec<usize>)> = vec![
            (
                "single socket, socket free, no pref",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                None,
                vec![0],
            ),
            (
                "single socket, socket not free, no pref",
                &single,
                set(&[1, 2, 3, 4, 5, 6, 7]),
                None,
                vec![],
            ),
            (
                "single socket, socket free, pref 0",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                Some(0),
                vec![0],
            ),
            (
                "single socket, socket not free, pref 0",
                &single,
                set(&[1, 2, 3, 4, 5, 6, 7]),
                Some(0),
                vec![],
            ),
            (
                "dual socket, both free, no pref",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                None,
                vec![0, 1],
            ),
            (
                "dual socket, socket 1 free, no pref",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 11]),
                None,
                vec![1],
            ),
            (
                "dual socket, none free, no pref",
                &dual,
                set(&[0, 2, 3, 4, 5, 6, 7, 8, 9, 11]),
                None,
                vec![],
            ),
            (
                "dual socket, both free, pref 0",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                Some(0),
                vec![0, 1],
            ),
            (
                "dual socket, only socket 1 free, pref 0",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 11]),
                Some(0),
                vec![1],
            ),
            (
                "dual socket, none free, pref 0",
                &dual,
                set(&[0, 2, 3, 4, 5, 6, 7, 8, 9, 11]),
                Some(0),
                vec![],
            ),
            (
                "dual socket, both free, pref 1",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                Some(1),
                vec![1, 0],
            ),
            (
                "dual socket, socket 1 free, pref 1",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 11]),
                Some(1),
                vec![1],
            ),
            (
                "dual socket, none free, pref 1",
                &dual,
                set(&[0, 2, 3, 4, 5, 6, 7, 8, 9, 11]),
                Some(1),
                vec![],
            ),
        ];

        for (desc, topo, available, pref, expect) in cases {
            let acc = CpuAccumulator::new(topo, &available, 0);
            assert_eq!(acc.free_sockets(pref), expect, "{desc}");
        }
    }

    #[test]
    fn test_free_cpus_ordering() {
        let single = single_socket_ht();
        let dual = dual_socket_ht();
        let cases: Vec<(&str, &CpuTopology, CpuSet, Option<usize>, Vec<usize>)> = vec![
            (
                "single socket, all free, no pref",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                None,
                vec![0, 4, 1, 5, 2, 6, 3, 7],
            ),
            (
                "single socket, 5 free, no pref",
                &single,
                set(&[3, 4, 5, 6, 7]),
                None,
                vec![4, 5, 6, 3, 7],
            ),
            (
                "single socket, all free, pref 0",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                Some(0),
                vec![0, 4, 1, 5, 2, 6, 3, 7],
            ),
            (
                "single socket, 5 free, pref 0",
                &single,
                set(&[3, 4, 5, 6, 7]),
                Some(0),
                vec![4, 5, 6, 3, 7],
            ),
            (
                "dual socket, all free, no pref",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                None,
                vec![0, 6, 2, 8, 4, 10, 1, 7, 3, 9, 5, 11],
            ),
            (
                "dual socket, 11 free, no pref",
                &dual,
                set(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                None,
                vec![6, 2, 8, 4, 10, 1, 7, 3, 9, 5, 11],
            ),
            (
                "dual socket, 10 free, no pref",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                None,
                vec![2, 8, 4, 10, 1, 7, 3, 9, 5, 11],
            ),
            (
                "dual socket, all free, pref 0",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                Some(0),
                vec![0, 6, 2, 8, 4, 10, 1, 7, 3, 9, 5, 11],
            ),
            (
                "dual socket, 11 free, pref 0",
                &dual,
                set(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                Some(0),
                vec![6, 2, 8, 4, 10, 1, 7, 3, 9, 5, 11],
            ),
            (
                "dual socket, 10 free, pref 0",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                Some(0),
                vec![2, 8, 4, 10, 1, 7, 3, 9, 5, 11],
            ),
            (
                "dual socket, all free, pref 1",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                Some(1),
                vec![1, 7, 3, 9, 5, 11, 0, 6, 2, 8, 4, 10],
            ),
            (
                "dual socket, 11 free, pref 1",
                &dual,
                set(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                Some(1),
                vec![1, 7, 3, 9, 5, 11, 6, 2, 8, 4, 10],
            ),
            (
                "dual socket, 10 free, pref 1",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                Some(1),
                vec![1, 7, 3, 9, 5, 11, 2, 8, 4, 10],
            ),
            (
                "dual socket, pref socket partially taken, pref 1",
                &dual,
                set(&[0, 2, 3, 4, 5, 6, 8, 9, 10, 11]),
                Some(1),
                vec![3, 9, 5, 11, 0, 6, 2, 8, 4, 10],
            ),
        ];

        for (desc, topo, available, pref, expect) in cases {
            let acc = CpuAccumulator::new(topo, &available, 0);
            let cpus = match pref {
                Some(p) => acc.free_cpus_preferred(p),
                None => acc.free_cpus(),
            };
            assert_eq!(cpus, expect, "{desc}");
        }
    }

    #[test]
    fn test_free_cores_best_fit() {
        let dual = dual_socket_ht();
        // Socket 0 is already partially consumed, so its remaining whole
        // cores sort ahead of socket 1's.
        let acc = CpuAccumulator::new(&dual, &set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]), 0);
        assert_eq!(acc.free_cores(), vec![2, 4, 1, 3, 5]);

        let acc = CpuAccumulator::new(&dual, &set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]), 0);
        assert_eq!(acc.free_cores(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_free_cores_key_monotone() {
        let dual = dual_socket_ht();
        let mut acc =
            CpuAccumulator::new(&dual, &set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]), 4);
        let cpus = acc.details.cpus_in_core(1);
        acc.take(&cpus);

        let key = |acc: &CpuAccumulator<'_>, core: usize| {
            let socket = acc.core_socket(core);
            (
                Reverse(
                    acc.topo
                        .details()
                        .cpus_in_socket(socket)
                        .intersection(&acc.result)
                        .len(),
                ),
                acc.details.cpus_in_socket(socket).len(),
                acc.details.cpus_in_core(core).len(),
                socket,
                core,
            )
        };

        let cores = acc.free_cores();
        // Socket 1 already holds result CPUs, so its whole cores lead.
        assert_eq!(cores, vec![3, 5, 0, 2, 4]);
        for pair in cores.windows(2) {
            assert!(key(&acc, pair[0]) <= key(&acc, pair[1]));
        }
    }

    #[test]
    fn test_take_maintains_invariants() {
        let dual = dual_socket_ht();
        let available = set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        let mut acc = CpuAccumulator::new(&dual, &available, 4);

        let core = acc.details.cpus_in_core(0);
        acc.take(&core);
        assert_eq!(acc.result, set(&[0, 6]));
        assert_eq!(acc.num_needed, 2);
        assert!(acc.result.intersection(&acc.details.cpus()).is_empty());
        assert!(acc.result.union(&acc.details.cpus()).is_subset(&available));
        assert!(!acc.is_socket_free(0));
        assert!(acc.is_socket_free(1));
        assert!(!acc.is_core_free(0));
        assert!(acc.is_core_free(2));
    }

    #[test]
    fn test_take_by_topology() {
        let single = single_socket_ht();
        let dual = dual_socket_ht();
        let cases: Vec<(
            &str,
            &CpuTopology,
            CpuSet,
            usize,
            Option<usize>,
            Result<CpuSet, AllocError>,
        )> = vec![
            (
                "more cpus than available",
                &single,
                set(&[0, 2, 4, 6]),
                5,
                None,
                Err(AllocError::NotEnoughCpus),
            ),
            (
                "zero cpus",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                0,
                None,
                Ok(set(&[])),
            ),
            (
                "one cpu",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                1,
                None,
                Ok(set(&[0])),
            ),
            (
                "one cpu, some taken",
                &single,
                set(&[1, 3, 5, 6, 7]),
                1,
                None,
                Ok(set(&[6])),
            ),
            (
                "two cpus share a core",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                2,
                None,
                Ok(set(&[0, 4])),
            ),
            (
                "all cpus",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                8,
                None,
                Ok(set(&[0, 1, 2, 3, 4, 5, 6, 7])),
            ),
            (
                "two cpus, only one core fully free",
                &single,
                set(&[0, 1, 2, 3, 6]),
                2,
                None,
                Ok(set(&[2, 6])),
            ),
            (
                "one cpu lands on the fuller socket",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                1,
                None,
                Ok(set(&[2])),
            ),
            (
                "a whole socket",
                &dual,
                set(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
                6,
                None,
                Ok(set(&[0, 2, 4, 6, 8, 10])),
            ),
            (
                "one cpu, pref 0",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                1,
                Some(0),
                Ok(set(&[0])),
            ),
            (
                "one cpu, some taken, pref 0",
                &single,
                set(&[1, 3, 5, 6, 7]),
                1,
                Some(0),
                Ok(set(&[6])),
            ),
            (
                "two cpus, pref 0",
                &single,
                set(&[0, 1, 2, 3, 4, 5, 6, 7]),
                2,
                Some(0),
                Ok(set(&[0, 4])),
            ),
            (
                "one cpu dual socket, pref 0",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                1,
                Some(0),
                Ok(set(&[2])),
            ),
            (
                "one cpu dual socket, pref 1",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                1,
                Some(1),
                Ok(set(&[1])),
            ),
            (
                "two cpus dual socket, pref 0",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                2,
                Some(0),
                Ok(set(&[2, 8])),
            ),
            (
                "two cpus dual socket, pref 1",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                2,
                Some(1),
                Ok(set(&[1, 7])),
            ),
            (
                "two cpus dual socket, some taken, pref 0",
                &dual,
                set(&[3, 4, 5, 7, 8, 9, 10, 11]),
                2,
                Some(0),
                Ok(set(&[4, 10])),
            ),
            (
                "two cpus dual socket, some taken, pref 1",
                &dual,
                set(&[3, 4, 5, 7, 8, 9, 10, 11]),
                2,
                Some(1),
                Ok(set(&[3, 9])),
            ),
            (
                "three cpus dual socket, pref 0",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                3,
                Some(0),
                Ok(set(&[2, 8, 4])),
            ),
            (
                "three cpus dual socket, pref 1",
                &dual,
                set(&[1, 2, 3, 4, 5, 7, 8, 9, 10, 11]),
                3,
                Some(1),
                Ok(set(&[1, 7, 3])),
            ),
        ];

        for (desc, topo, available, num_cpus, pref, expect) in cases {
            let result = take_by_topology(topo, &available, num_cpus, pref);
            assert_eq!(result, expect, "{desc}");

            if let Ok(cpus) = &result {
                assert_eq!(cpus.len(), num_cpus, "{desc}: wrong count");
                assert!(cpus.is_subset(&available), "{desc}: outside available");
                // Same inputs, same answer.
                assert_eq!(
                    take_by_topology(topo, &available, num_cpus, pref).unwrap(),
                    *cpus,
                    "{desc}: not deterministic"
                );
            }
        }
    }

    #[test]
    fn test_preference_never_breaks_feasibility() {
        let dual = dual_socket_ht();
        // Only socket 0 has CPUs left; preferring socket 1 must still succeed.
        let available = set(&[0, 2, 4, 6]);
        let result = take_by_topology(&dual, &available, 3, Some(1)).unwrap();
        assert_eq!(result.len(), 3);
        assert!(result.is_subset(&available));
    }
}

//! # Topology Discovery
//!
//! Builds a [`CpuTopology`] for the running machine:
//!
//! 1. Linux: walk sysfs (`/sys/devices/system/cpu`, `/sys/devices/system/node`)
//! 2. Other platforms, or on any sysfs failure: synthesise a single-socket
//!    topology from the logical and physical CPU counts
//!
//! [`discover`] never fails over to an error when the fallback can stand in;
//! only a machine the fallback cannot describe surfaces a
//! [`TopologyError`].

use crate::topology::{CpuDetail, CpuTopology, TopologyError};

/// Detects the machine topology, falling back to a synthetic single-socket
/// description when platform data is unavailable.
///
/// # Errors
///
/// [`TopologyError::Malformed`] when even the fallback cannot describe the
/// machine; in practice unreachable.
pub fn discover() -> Result<CpuTopology, TopologyError> {
    #[cfg(target_os = "linux")]
    {
        match from_sysfs() {
            Ok(topo) => {
                tracing::info!("detected topology: {}", topo.summary());
                return Ok(topo);
            }
            Err(err) => {
                tracing::warn!("sysfs topology detection failed ({err}), using fallback");
            }
        }
    }

    let topo = fallback()?;
    tracing::info!("using fallback topology: {}", topo.summary());
    Ok(topo)
}

/// Reads the topology from Linux sysfs.
///
/// Online CPUs come from `/sys/devices/system/cpu/online`; each CPU's core
/// and package from its `topology/` directory; NUMA membership from the
/// per-node `cpulist` files. CPUs no node claims land on node 0. Raw sysfs
/// core IDs repeat across packages, so `(package, core)` pairs are remapped
/// to dense unique core IDs before construction.
///
/// # Errors
///
/// [`TopologyError::Detection`] on any unreadable or unparseable sysfs
/// file; [`TopologyError::Malformed`] when the files describe an
/// inconsistent machine.
#[cfg(target_os = "linux")]
pub fn from_sysfs() -> Result<CpuTopology, TopologyError> {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    use crate::cpuset::CpuSet;

    fn read_usize(path: &Path) -> Result<usize, TopologyError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| TopologyError::Detection(format!("{}: {e}", path.display())))?;
        raw.trim()
            .parse()
            .map_err(|e| TopologyError::Detection(format!("{}: {e}", path.display())))
    }

    let online: CpuSet = fs::read_to_string("/sys/devices/system/cpu/online")
        .map_err(|e| TopologyError::Detection(format!("cpu online list: {e}")))?
        .trim()
        .parse()
        .map_err(|e| TopologyError::Detection(format!("cpu online list: {e}")))?;
    if online.is_empty() {
        return Err(TopologyError::Detection("no online cpus".into()));
    }

    // NUMA membership; a machine without the node directory is one node.
    let mut node_of: BTreeMap<usize, usize> = BTreeMap::new();
    let node_root = Path::new("/sys/devices/system/node");
    if node_root.exists() {
        let entries = fs::read_dir(node_root)
            .map_err(|e| TopologyError::Detection(format!("node dir: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| TopologyError::Detection(format!("node dir: {e}")))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok()) else {
                continue;
            };
            let cpulist = entry.path().join("cpulist");
            if let Ok(raw) = fs::read_to_string(&cpulist) {
                let cpus: CpuSet = raw.trim().parse().map_err(|e| {
                    TopologyError::Detection(format!("{}: {e}", cpulist.display()))
                })?;
                for cpu in &cpus {
                    node_of.insert(cpu, id);
                }
            }
        }
    }

    let mut dense_cores: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut records = Vec::with_capacity(online.len());
    for cpu in &online {
        let topo_dir = Path::new("/sys/devices/system/cpu")
            .join(format!("cpu{cpu}"))
            .join("topology");
        let raw_core = read_usize(&topo_dir.join("core_id"))?;
        let socket = read_usize(&topo_dir.join("physical_package_id"))?;
        let next = dense_cores.len();
        let core = *dense_cores.entry((socket, raw_core)).or_insert(next);
        records.push(CpuDetail {
            cpu_id: cpu,
            core_id: core,
            socket_id: socket,
            numa_node_id: node_of.get(&cpu).copied().unwrap_or(0),
        });
    }

    CpuTopology::new(records)
}

/// Synthesises a single-socket, single-node topology from CPU counts.
///
/// When the logical count divides evenly over physical cores, hardware
/// threads are spread over them the way Linux enumerates siblings
/// (thread `t` of core `c` is CPU `t * cores + c`); otherwise every
/// logical CPU is modelled as its own core.
fn fallback() -> Result<CpuTopology, TopologyError> {
    let logical = num_cpus::get().max(1);
    let physical = num_cpus::get_physical().max(1);
    let cores = if logical % physical == 0 { physical } else { logical };

    let records = (0..logical)
        .map(|cpu| CpuDetail {
            cpu_id: cpu,
            core_id: cpu % cores,
            socket_id: 0,
            numa_node_id: 0,
        })
        .collect();
    CpuTopology::new(records)
}

//! Discover the machine topology, reserve a few CPUs, and print the NUMA
//! hints the topology coordinator would see.
//!
//! Run with: cargo run --example allocate

use coreplane_core::{discover, take_by_topology, HintGenerator};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let topo = discover::discover()?;
    println!("topology: {}", topo.summary());

    let available = topo.details().cpus();
    let request = topo.cpus_per_core().min(topo.num_cpus());

    let cpus = take_by_topology(&topo, &available, request, None)?;
    println!("allocated {request} cpus: {cpus}");

    let hints = HintGenerator::new(&topo).generate_hints(&available, request);
    for hint in &hints {
        println!(
            "hint: nodes {:?} preferred={}",
            hint.numa_affinity.nodes(),
            hint.preferred
        );
    }

    Ok(())
}

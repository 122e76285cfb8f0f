//! Sort random particles along the space filling curve across MPI ranks.

use itertools::Itertools;
use sph_tree::{
    comm::{Comm, MpiComm},
    config::SphConfig,
    distributor::Distributor,
    domain::Domain,
    geometry::PhysicalBox,
    tools::{gather_to_root, generate_random_bodies, is_sorted_array, seeded_rng},
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();
    let comm = MpiComm::new(universe.world());

    tracing_subscriber::fmt::init();

    let mut rng = seeded_rng(comm.rank());

    // Create `nbodies` per rank.
    let nbodies = 10000;
    let range = PhysicalBox::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
    let mut domain = Domain::new(generate_random_bodies(
        nbodies,
        &range,
        0.01,
        comm.rank(),
        &mut rng,
    ));

    let mut distributor = Distributor::new(&comm, SphConfig::default());
    distributor.repartition(&mut domain);

    let keys = domain.bodies().iter().map(|b| b.sort_key()).collect_vec();
    assert!(is_sorted_array(&keys, &comm));

    if let Some(all) = gather_to_root(&keys, &comm) {
        assert_eq!(all.len(), nbodies * comm.size());
        assert!(all.iter().tuple_windows().all(|(a, b)| a < b));

        println!(
            "Sorted {} particles. Local counts: {:?}",
            all.len(),
            distributor.local_counts()
        );
    }
}

//! Test the computation of the global particle range across MPI ranks.

use sph_tree::{
    comm::{Comm, MpiComm},
    config::SphConfig,
    distributor::Distributor,
    geometry::PhysicalBox,
    tools::{gather_to_root, generate_random_bodies, seeded_rng},
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();
    let comm = MpiComm::new(universe.world());

    let mut rng = seeded_rng(comm.rank());

    // Create `nbodies` per rank, the last rank none at all.
    let nbodies = if comm.rank() + 1 == comm.size() && comm.size() > 1 {
        0
    } else {
        100
    };
    let range = PhysicalBox::new([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]);
    let bodies = generate_random_bodies(nbodies, &range, 0.01, comm.rank(), &mut rng);

    let mut distributor = Distributor::new(&comm, SphConfig::default());
    let global = distributor.compute_range(&bodies);

    // Copy all bodies to root and compare the range there.

    if let Some(bodies_root) = gather_to_root(&bodies, &comm) {
        let mut expected = PhysicalBox::empty();
        for body in bodies_root.iter() {
            expected.grow(&body.position, body.radius());
        }
        assert_eq!(expected, global);

        println!("Global range: {}", global);
    }
}

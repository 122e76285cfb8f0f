//! Complete the local trees with branch summaries of all other ranks.

use approx::assert_relative_eq;
use sph_tree::{
    comm::{Comm, MpiComm},
    config::SphConfig,
    distributor::Distributor,
    domain::Domain,
    geometry::PhysicalBox,
    tools::{gather_to_all, generate_random_bodies, seeded_rng},
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();
    let comm = MpiComm::new(universe.world());

    tracing_subscriber::fmt::init();

    let mut rng = seeded_rng(comm.rank());

    let nbodies = 2000;
    let range = PhysicalBox::new([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]);
    let mut domain = Domain::new(generate_random_bodies(
        nbodies,
        &range,
        0.02,
        comm.rank(),
        &mut rng,
    ));

    let mut distributor = Distributor::new(&comm, SphConfig::default());
    distributor.repartition(&mut domain);

    let mut tree = distributor.build_tree(&domain);
    let inserted = distributor.exchange_branches(&mut tree, &domain);

    // Every completed tree accounts for the mass of all particles.
    let all = gather_to_all(domain.bodies(), &comm);
    let total_mass = all.iter().map(|b| b.mass).sum::<f64>();

    assert_relative_eq!(tree.root().mass(), total_mass, max_relative = 1E-10);
    assert_eq!(tree.root().sub_entities(), all.len());

    println!(
        "Rank {} inserted {} remote branches, {} non-local branches in total.",
        comm.rank(),
        inserted,
        tree.num_nonlocal_branches()
    );
}

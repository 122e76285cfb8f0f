//! Exchange ghosts and compare neighbor lists with a brute force search.

use itertools::Itertools;
use sph_tree::{
    comm::{Comm, MpiComm},
    config::SphConfig,
    distributor::Distributor,
    domain::Domain,
    geometry::{distance, DomainShape, PhysicalBox},
    tools::{gather_to_all, generate_bodies_from_config},
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();
    let comm = MpiComm::new(universe.world());

    tracing_subscriber::fmt::init();

    let config = SphConfig {
        domain_shape: DomainShape::Sphere,
        seed: 17,
        ..SphConfig::default()
    };

    let nbodies = 1000;
    let range = PhysicalBox::new([0.0, 0.0], [1.0, 1.0]);
    let bodies =
        generate_bodies_from_config(nbodies, &range, 0.02, comm.rank(), &config).unwrap();
    let mut domain = Domain::new(bodies);

    let mut distributor = Distributor::new(&comm, config);
    distributor.repartition(&mut domain);

    let mut tree = distributor.build_tree(&domain);
    distributor.exchange_branches(&mut tree, &domain);
    let nghosts = distributor.compute_ghosts(&mut tree, &mut domain).unwrap();

    let all = gather_to_all(domain.bodies(), &comm);

    for body in domain.bodies() {
        let radius = distributor.support_radius(body);
        let found = distributor
            .neighbors(&tree, &body.position, radius)
            .into_iter()
            .map(|holder| holder.resolve(&domain).unwrap().id)
            .sorted()
            .collect_vec();
        let expected = all
            .iter()
            .filter(|other| distance(&other.position, &body.position) <= radius)
            .map(|other| other.id)
            .sorted()
            .collect_vec();
        assert_eq!(found, expected);
    }

    println!(
        "Rank {} received {} ghosts for {} particles.",
        comm.rank(),
        nghosts,
        domain.len()
    );
}

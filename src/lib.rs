//! Distributed tree, domain decomposition and ghost exchange for
//! Smoothed Particle Hydrodynamics.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod body;
pub mod comm;
pub mod config;
pub mod constants;
pub mod distributor;
pub mod domain;
pub mod entity;
pub mod error;
pub mod geometry;
pub mod interp;
pub mod kernel;
pub mod morton;
pub mod parsort;
pub mod snapshot;
pub mod state;
pub mod tools;
pub mod tree;

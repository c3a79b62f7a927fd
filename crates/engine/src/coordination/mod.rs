//! Coordinators for nodes whose progress depends on other nodes
//!
//! - [`GatewayCoordinator`] - joins tokens and fires a gateway exactly once
//! - [`MultiInstanceCoordinator`] - fans a node out over a cardinality or collection
//! - [`LoopCoordinator`] - repeats a node while its loop condition holds

mod gateway;
mod loop_activity;
mod multi_instance;

pub use gateway::{GatewayArrival, GatewayCoordinator};
pub use loop_activity::LoopCoordinator;
pub use multi_instance::MultiInstanceCoordinator;

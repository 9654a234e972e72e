//! Scene data structures

pub mod node;

pub use node::{NodeArena, NodeId};

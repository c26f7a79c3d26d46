//! dice: tile-based deployment orchestration.
//!
//! A deployment names tile instances; tiles declare inputs, outputs and the
//! tiles they depend on. The engine resolves the instance graph, turns it
//! into an ordered plan of shell stages and runs them, sequentially or one
//! family at a time in parallel, passing outputs between instances.

pub mod cli;
pub mod core;
pub mod repo;
pub mod sink;
pub mod transport;

//! Core engine: types, parsing, resolution, planning, execution.

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod extract;
pub mod journal;
pub mod parser;
pub mod planner;
pub mod probe;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod script;
pub mod state;
pub mod types;

//! Command line interface

pub mod commands;
pub mod simulate;

pub use commands::{Cli, Commands};
pub use simulate::{simulate, SimulationReport};

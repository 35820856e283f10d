//! SmartPin Harness
//!
//! Convergence simulator for the sync layer: several clients, one scope,
//! an in-memory backend with injected faults.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod check;
pub mod simulator;

pub use check::{stale_rollups, ExpectedState};
pub use simulator::{
    run_simulator, SimulatedOperation, SimulatorConfig, SimulatorReport, SimulatorStats, Violation,
};

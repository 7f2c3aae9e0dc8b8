//! Bounded recursive sub-agent: a signature-driven loop alternating
//! main-model turns with kernel executions, with helpers injected into the
//! kernel that call back into the host.

pub mod runner;
pub mod signature;

pub use runner::{RunFailure, SubAgentLimits, SubAgentRun, SubAgentRunner, TrajectoryStep};
pub use signature::{Field, Signature};

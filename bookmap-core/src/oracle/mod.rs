//! Pass 3: the external oracle and everything around calling it.

pub mod client;
pub mod discovery;
pub mod prompt;
pub mod response;
pub mod retry;

pub use client::{HttpOracle, OracleError, OracleExchange, ScriptedOracle, StructureOracle};
pub use discovery::{assign_original_indices, DiscoveryPlan, DiscoveryStats, OracleDiscovery};
pub use retry::{ask_structured, with_bounded_retry, AttemptOutcome, RetryOutcome};

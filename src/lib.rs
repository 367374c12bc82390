//! Job orchestration core for audio transcription.
//!
//! Jobs move PENDING → PROCESSING → COMPLETED | FAILED under
//! [`state_machine`]; every move is committed together with its audit events by
//! [`store::Ledger`]; calls to the external worker go through the circuit
//! breaker and deadlines in [`resilience`]. [`orchestrator::JobOrchestrator`]
//! ties these together.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod resilience;
pub mod router;
pub mod state_machine;
pub mod storage;
pub mod store;
pub mod worker;

pub use error::{ConflictKind, OrchestratorError, Result};

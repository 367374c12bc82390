//! Failure controls around calls to the transcription worker.

mod circuit_breaker;
mod invoker;

pub use circuit_breaker::{BreakerMetrics, BreakerTransition, CircuitBreaker, CircuitState};
pub use invoker::{DispatchError, ResilientInvoker};

#[cfg(test)]
pub(crate) use invoker::tests::StubWorker;

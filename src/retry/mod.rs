//! Failure handling for target operations.
//!
//! Provides:
//! - `classify`: maps an `OperationError` onto an `ErrorKind`
//! - `CircuitBreaker` / `BreakerRegistry`: per operation-class breakers
//! - `RetryController`: exponential backoff with jitter behind the breakers

mod circuit_breaker;
mod classifier;
mod controller;

pub use circuit_breaker::*;
pub use classifier::*;
pub use controller::*;

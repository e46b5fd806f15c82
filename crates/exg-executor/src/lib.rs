//! The executor: order intent in, position or classified failure out,
//! within a bounded number of broker submit attempts.

pub mod error;
pub mod executor;
pub mod retry;

pub use error::{ExecutorError, ExecutorResult};
pub use executor::{ExecutionOutcome, Executor};
pub use retry::{classify, FailureClass, RetryPolicy, MAX_SUBMIT_ATTEMPTS};

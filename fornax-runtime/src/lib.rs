//! Continuous-batching runtime for the fornax step engine.
//!
//! The runtime multiplexes many generation requests through the
//! single-sequence engine: an iteration-level [`Scheduler`] forms one batch
//! per loop (decode-first, never mixing prefill and decode), the
//! [`BatchedRunner`] executes it by stepping each member in turn, and the
//! [`RequestIntake`] stages requests arriving from a producer thread in
//! between iterations.

pub mod intake;
pub mod metrics;
pub mod request;
pub mod runner;
pub mod scheduler;

pub use intake::{RequestIntake, RequestSubmitter};
pub use metrics::BenchmarkMetrics;
pub use request::{FinishReason, Request, RequestStatus};
pub use runner::BatchedRunner;
pub use scheduler::{BatchKind, ScheduledBatch, Scheduler, SchedulerConfig};

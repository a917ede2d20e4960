//! RouteFlow stateful processors
//!
//! The windowing operators of the routing engine:
//! - AggregateProcessor: merges exchanges sharing a correlation key under
//!   pluggable completion conditions, backed by an AggregationRepository
//! - BatchResequencer/StreamResequencer: restore a defined order among
//!   out-of-order arrivals
//! - IdempotentConsumer: dedup filter with two-phase repository semantics
//!
//! All cross-exchange state lives behind the processors' own synchronization;
//! the rest of a route is exchange-local and lock-free by construction.

pub mod aggregate;
pub mod idempotent;
pub mod repository;
pub mod resequence;

mod util;

pub use aggregate::{AggregateConfig, AggregateProcessor, AggregationStrategy};
pub use idempotent::{IdempotentConfig, IdempotentConsumer};
pub use repository::{
    FileIdempotentRepository, InMemoryAggregationRepository, InMemoryIdempotentRepository,
};
pub use resequence::{
    BatchResequencer, NumericSequenceComparator, ResequenceMode, SequenceComparator,
    StreamResequencer,
};

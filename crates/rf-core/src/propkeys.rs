//! Well-known exchange property keys.

/// Correlation key computed by the aggregator for this exchange.
pub const CORRELATION_KEY: &str = "routeflow.correlation_key";

/// Number of exchanges merged into an aggregated exchange.
pub const AGGREGATED_SIZE: &str = "routeflow.aggregated_size";

/// Which completion condition emitted an aggregated exchange:
/// "predicate", "size", "timeout", or "force".
pub const AGGREGATED_COMPLETED_BY: &str = "routeflow.aggregated_completed_by";

/// Set on an incoming exchange to force-complete its aggregation group.
pub const AGGREGATION_COMPLETE_GROUP: &str = "routeflow.aggregation_complete_group";

/// Marks an exchange detected as a duplicate by the idempotent consumer.
pub const DUPLICATE_MESSAGE: &str = "routeflow.duplicate_message";

/// Endpoint uri an exhausted exchange was dead-lettered to.
pub const FAILURE_ENDPOINT: &str = "routeflow.failure_endpoint";

/// Redelivery counter at the time the exchange was given up on.
pub const FAILURE_REDELIVERY_COUNTER: &str = "routeflow.failure_redelivery_counter";

/// Display form of the last failed processor.
pub const FAILURE_PROCESSOR: &str = "routeflow.failure_processor";

/// Set by the stop processor to short-circuit the remaining pipeline.
pub const ROUTE_STOP: &str = "routeflow.route_stop";

//! Route model, reifier, async routing engine, and error handling.
//!
//! Routes are described declaratively with [`RouteBuilder`], registered on a
//! [`RouteflowContext`], and reified into processor graphs when the context
//! starts. Exchanges enter through endpoint consumers or a
//! [`ProducerTemplate`] and flow through the pipeline one step at a time.

pub mod context;
pub mod endpoints;
pub mod error_handler;
pub mod model;
pub mod processor;
pub mod reifier;
pub mod template;

pub use context::RouteflowContext;
pub use endpoints::{DirectEndpoint, LogEndpoint, MockEndpoint};
pub use error_handler::{OnExceptionClause, RedeliveryErrorHandler, RedeliveryPolicy};
pub use model::{
    AggregateDefinition, ErrorHandlerDefinition, IdempotentDefinition,
    OnExceptionDefinition, ResequenceDefinition, RouteBuilder, RouteDefinition,
    StepDefinition, WhenClause,
};
pub use processor::{
    tokenize_expression, ChoiceProcessor, FilterProcessor, LogProcessor, Pipeline,
    SendProcessor, SetBodyProcessor, SetHeaderProcessor, SplitExpression, SplitProcessor,
    StopProcessor,
};
pub use reifier::{CustomReifyFn, Reifier};
pub use template::ProducerTemplate;

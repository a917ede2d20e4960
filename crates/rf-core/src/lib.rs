//! RouteFlow core model
//!
//! This crate provides the data model and SPI contracts shared by the engine
//! and the stateful processors:
//! - Exchange/Message: the unit of work flowing through routes
//! - Value: dynamically typed bodies, headers, and properties
//! - TypeConverterRegistry: on-demand conversion between value representations
//! - Processor: the basic unit of route execution
//! - Endpoint/Producer/Consumer: the transport boundary contract
//! - AggregationRepository/IdempotentRepository: pluggable state stores

pub mod converter;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod message;
pub mod processor;
pub mod propkeys;
pub mod repository;
pub mod value;

pub use converter::{ConversionError, TypeConverterRegistry};
pub use endpoint::{
    CompletionToken, Consumer, Endpoint, EndpointRegistry, Producer,
};
pub use error::{Result, RouteflowError};
pub use exchange::{Exchange, ExchangePattern};
pub use message::{Headers, Message};
pub use processor::{Expression, Predicate, Processor};
pub use repository::{AggregationRepository, IdempotentRepository};
pub use value::Value;

//! Turns route definitions into runnable processor graphs.
//!
//! Reification happens at route-start time: endpoint resolution, dead-letter
//! wiring, and step validation all fail here as configuration errors, never
//! once messages flow.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use rf_core::{EndpointRegistry, Processor, Result, RouteflowError};
use rf_processor::{
    AggregateConfig, AggregateProcessor, BatchResequencer, IdempotentConfig,
    IdempotentConsumer, ResequenceMode, StreamResequencer,
};

use crate::error_handler::{OnExceptionClause, RedeliveryErrorHandler};
use crate::model::{RouteDefinition, StepDefinition};
use crate::processor::{
    ChoiceProcessor, FilterProcessor, LogProcessor, Pipeline, SendProcessor,
    SetBodyProcessor, SetHeaderProcessor, SplitProcessor, StopProcessor,
};

/// Builds a processor for a custom step from its configuration.
pub type CustomReifyFn =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Processor>> + Send + Sync>;

/// Step-definition to processor translation, extensible with custom kinds.
pub struct Reifier {
    custom: DashMap<String, CustomReifyFn>,
}

impl Reifier {
    pub fn new() -> Self {
        Self {
            custom: DashMap::new(),
        }
    }

    /// Register a reifier for `StepDefinition::Custom` steps of this kind.
    pub fn register_custom(&self, kind: impl Into<String>, reify: CustomReifyFn) {
        self.custom.insert(kind.into(), reify);
    }

    /// Reify a route into its root processor. The source consumer is created
    /// separately by the context from the route's `from` endpoint.
    pub fn reify(
        &self,
        definition: &RouteDefinition,
        endpoints: &EndpointRegistry,
    ) -> Result<Arc<dyn Processor>> {
        let steps = self.reify_steps(&definition.steps, endpoints)?;
        let pipeline: Arc<dyn Processor> =
            Arc::new(Pipeline::new(definition.id.clone(), steps));

        let root = match &definition.error_handler {
            None => pipeline,
            Some(handler) => {
                let dead_letter = match &handler.dead_letter_uri {
                    None => None,
                    Some(uri) => {
                        let producer = endpoints.resolve(uri)?.create_producer()?;
                        Some((uri.clone(), producer))
                    }
                };
                let clauses = handler
                    .on_exceptions
                    .iter()
                    .map(|def| {
                        let steps = if def.steps.is_empty() {
                            None
                        } else {
                            let reified = self.reify_steps(&def.steps, endpoints)?;
                            Some(Arc::new(Pipeline::new("on-exception", reified))
                                as Arc<dyn Processor>)
                        };
                        Ok(OnExceptionClause {
                            matches: def.matches.clone(),
                            handled: def.handled,
                            maximum_redeliveries: def.maximum_redeliveries,
                            steps,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(RedeliveryErrorHandler::new(
                    pipeline,
                    handler.policy.clone(),
                    dead_letter,
                    clauses,
                ))
            }
        };

        debug!(route_id = %definition.id, from = %definition.from, "Route reified");
        Ok(root)
    }

    /// Reify an ordered step list. Stateful steps wrap the remaining tail of
    /// the list, so everything after them becomes their downstream child.
    fn reify_steps(
        &self,
        steps: &[StepDefinition],
        endpoints: &EndpointRegistry,
    ) -> Result<Vec<Arc<dyn Processor>>> {
        let mut out: Vec<Arc<dyn Processor>> = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            match step {
                StepDefinition::To(uri) => {
                    let producer = endpoints.resolve(uri)?.create_producer()?;
                    out.push(Arc::new(SendProcessor::new(uri.clone(), producer)));
                }
                StepDefinition::Process(processor) => out.push(processor.clone()),
                StepDefinition::SetBody(expression) => {
                    out.push(Arc::new(SetBodyProcessor::new(expression.clone())));
                }
                StepDefinition::SetHeader(name, expression) => {
                    out.push(Arc::new(SetHeaderProcessor::new(
                        name.clone(),
                        expression.clone(),
                    )));
                }
                StepDefinition::Filter { predicate, steps } => {
                    let child = self.nested_pipeline("filter-body", steps, endpoints)?;
                    out.push(Arc::new(FilterProcessor::new(predicate.clone(), child)));
                }
                StepDefinition::Choice { when, otherwise } => {
                    let branches = when
                        .iter()
                        .map(|clause| {
                            let child =
                                self.nested_pipeline("when-body", &clause.steps, endpoints)?;
                            Ok((clause.predicate.clone(), child))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let otherwise = match otherwise {
                        Some(steps) => {
                            Some(self.nested_pipeline("otherwise-body", steps, endpoints)?)
                        }
                        None => None,
                    };
                    out.push(Arc::new(ChoiceProcessor::new(branches, otherwise)));
                }
                StepDefinition::Split { expression, steps } => {
                    let child = self.nested_pipeline("split-body", steps, endpoints)?;
                    out.push(Arc::new(SplitProcessor::new(expression.clone(), child)));
                }
                StepDefinition::Aggregate(def) => {
                    let child = self.tail_pipeline("aggregate-out", &steps[index + 1..], endpoints)?;
                    let mut config = AggregateConfig::new(def.correlation.clone());
                    if let Some(size) = def.completion_size {
                        config = config.completion_size(size);
                    }
                    if let Some(timeout) = def.completion_timeout {
                        config = config.completion_timeout(timeout);
                    }
                    if let Some(predicate) = &def.completion_predicate {
                        config = config.completion_predicate(predicate.clone());
                    }
                    out.push(Arc::new(AggregateProcessor::new(
                        config,
                        def.strategy.clone(),
                        child,
                    )?));
                    return Ok(out);
                }
                StepDefinition::Resequence(def) => {
                    let child =
                        self.tail_pipeline("resequence-out", &steps[index + 1..], endpoints)?;
                    let processor: Arc<dyn Processor> = match def.mode {
                        ResequenceMode::Stream { timeout } => Arc::new(
                            StreamResequencer::new(def.comparator.clone(), timeout, child),
                        ),
                        ResequenceMode::Batch { size, timeout } => Arc::new(
                            BatchResequencer::new(def.comparator.clone(), size, timeout, child)?,
                        ),
                    };
                    out.push(processor);
                    return Ok(out);
                }
                StepDefinition::Idempotent(def) => {
                    let child =
                        self.tail_pipeline("idempotent-out", &steps[index + 1..], endpoints)?;
                    let config = IdempotentConfig::new(def.expression.clone())
                        .eager(def.eager)
                        .skip_duplicate(def.skip_duplicate);
                    out.push(Arc::new(IdempotentConsumer::new(
                        config,
                        def.repository.clone(),
                        child,
                    )));
                    return Ok(out);
                }
                StepDefinition::Log(message) => {
                    out.push(Arc::new(LogProcessor::new(message.clone())));
                }
                StepDefinition::Stop => out.push(Arc::new(StopProcessor)),
                StepDefinition::Custom { kind, config } => {
                    let reify = self.custom.get(kind).map(|r| r.value().clone()).ok_or_else(
                        || {
                            RouteflowError::Configuration(format!(
                                "no reifier registered for custom step kind '{kind}'"
                            ))
                        },
                    )?;
                    out.push(reify(config)?);
                }
            }
        }

        Ok(out)
    }

    fn nested_pipeline(
        &self,
        name: &str,
        steps: &[StepDefinition],
        endpoints: &EndpointRegistry,
    ) -> Result<Arc<dyn Processor>> {
        Ok(Arc::new(Pipeline::new(
            name.to_string(),
            self.reify_steps(steps, endpoints)?,
        )))
    }

    fn tail_pipeline(
        &self,
        name: &str,
        steps: &[StepDefinition],
        endpoints: &EndpointRegistry,
    ) -> Result<Arc<dyn Processor>> {
        self.nested_pipeline(name, steps, endpoints)
    }
}

impl Default for Reifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RouteBuilder;

    #[test]
    fn unresolvable_endpoint_fails_reification() {
        let reifier = Reifier::new();
        let endpoints = EndpointRegistry::new();
        let definition = RouteBuilder::from("direct:in").to("direct:missing").build();

        assert!(matches!(
            reifier.reify(&definition, &endpoints),
            Err(RouteflowError::Configuration(_))
        ));
    }

    #[test]
    fn unknown_custom_kind_fails_reification() {
        let reifier = Reifier::new();
        let endpoints = EndpointRegistry::new();
        let definition = RouteBuilder::from("direct:in")
            .step(StepDefinition::Custom {
                kind: "throttle".to_string(),
                config: serde_json::json!({}),
            })
            .build();

        assert!(matches!(
            reifier.reify(&definition, &endpoints),
            Err(RouteflowError::Configuration(_))
        ));
    }
}

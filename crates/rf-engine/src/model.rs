//! Route model: the declarative description of a route, built once and
//! turned into runnable processors by the reifier at start time.

use std::sync::Arc;
use std::time::Duration;

use rf_core::{Expression, IdempotentRepository, Predicate, Processor, RouteflowError};
use rf_processor::{AggregationStrategy, ResequenceMode, SequenceComparator};

use crate::error_handler::RedeliveryPolicy;
use crate::processor::SplitExpression;

/// A complete route: a source endpoint, an ordered list of steps, and an
/// optional error-handling policy covering the whole route.
pub struct RouteDefinition {
    pub id: String,
    pub from: String,
    pub steps: Vec<StepDefinition>,
    pub error_handler: Option<ErrorHandlerDefinition>,
}

/// One step in a route. Stateful steps (aggregate, resequence, idempotent)
/// wrap the remainder of the route: completed output continues with the
/// steps that follow them.
pub enum StepDefinition {
    /// Send to the endpoint with this uri.
    To(String),
    /// Invoke an arbitrary processor.
    Process(Arc<dyn Processor>),
    /// Replace the current message body with the expression result.
    SetBody(Expression),
    /// Set a header on the current message from the expression result.
    SetHeader(String, Expression),
    /// Continue with the nested steps only when the predicate holds.
    Filter {
        predicate: Predicate,
        steps: Vec<StepDefinition>,
    },
    /// First matching branch wins; the otherwise branch catches the rest.
    Choice {
        when: Vec<WhenClause>,
        otherwise: Option<Vec<StepDefinition>>,
    },
    /// Break the message into fragments, each processed by the nested steps.
    Split {
        expression: SplitExpression,
        steps: Vec<StepDefinition>,
    },
    Aggregate(AggregateDefinition),
    Resequence(ResequenceDefinition),
    Idempotent(IdempotentDefinition),
    /// Log a line at info level with exchange context.
    Log(String),
    /// Mark the exchange complete; later steps are skipped.
    Stop,
    /// A step reified by a custom reifier registered under `kind`.
    Custom {
        kind: String,
        config: serde_json::Value,
    },
}

pub struct WhenClause {
    pub predicate: Predicate,
    pub steps: Vec<StepDefinition>,
}

pub struct AggregateDefinition {
    pub correlation: Expression,
    pub strategy: Arc<dyn AggregationStrategy>,
    pub completion_size: Option<usize>,
    pub completion_timeout: Option<Duration>,
    pub completion_predicate: Option<Predicate>,
}

pub struct ResequenceDefinition {
    pub comparator: Arc<dyn SequenceComparator>,
    pub mode: ResequenceMode,
}

pub struct IdempotentDefinition {
    pub expression: Expression,
    pub repository: Arc<dyn IdempotentRepository>,
    pub eager: bool,
    pub skip_duplicate: bool,
}

/// Error handling for a route: redelivery with optional dead-lettering, plus
/// exception-specific overrides consulted before the default policy.
pub struct ErrorHandlerDefinition {
    pub policy: RedeliveryPolicy,
    pub dead_letter_uri: Option<String>,
    pub on_exceptions: Vec<OnExceptionDefinition>,
}

impl ErrorHandlerDefinition {
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            policy,
            dead_letter_uri: None,
            on_exceptions: Vec::new(),
        }
    }

    pub fn dead_letter(mut self, uri: impl Into<String>) -> Self {
        self.dead_letter_uri = Some(uri.into());
        self
    }

    pub fn on_exception(mut self, clause: OnExceptionDefinition) -> Self {
        self.on_exceptions.push(clause);
        self
    }
}

/// Matches a class of errors and overrides how they are handled.
pub struct OnExceptionDefinition {
    pub matches: Arc<dyn Fn(&RouteflowError) -> bool + Send + Sync>,
    /// When true the failure is considered dealt with: the exception is
    /// cleared and the caller sees success.
    pub handled: bool,
    /// Redelivery override for this error class; falls back to the route
    /// policy when unset.
    pub maximum_redeliveries: Option<u32>,
    pub steps: Vec<StepDefinition>,
}

impl OnExceptionDefinition {
    pub fn new(matches: impl Fn(&RouteflowError) -> bool + Send + Sync + 'static) -> Self {
        Self {
            matches: Arc::new(matches),
            handled: false,
            maximum_redeliveries: None,
            steps: Vec::new(),
        }
    }

    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    pub fn maximum_redeliveries(mut self, max: u32) -> Self {
        self.maximum_redeliveries = Some(max);
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }
}

/// Fluent construction of a [`RouteDefinition`].
pub struct RouteBuilder {
    id: String,
    from: String,
    steps: Vec<StepDefinition>,
    error_handler: Option<ErrorHandlerDefinition>,
}

impl RouteBuilder {
    pub fn from(uri: impl Into<String>) -> Self {
        let from = uri.into();
        Self {
            id: format!("route-{from}"),
            from,
            steps: Vec::new(),
            error_handler: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn to(mut self, uri: impl Into<String>) -> Self {
        self.steps.push(StepDefinition::To(uri.into()));
        self
    }

    pub fn process(mut self, processor: Arc<dyn Processor>) -> Self {
        self.steps.push(StepDefinition::Process(processor));
        self
    }

    pub fn set_body(mut self, expression: Expression) -> Self {
        self.steps.push(StepDefinition::SetBody(expression));
        self
    }

    pub fn set_header(mut self, name: impl Into<String>, expression: Expression) -> Self {
        self.steps
            .push(StepDefinition::SetHeader(name.into(), expression));
        self
    }

    pub fn filter(mut self, predicate: Predicate, steps: Vec<StepDefinition>) -> Self {
        self.steps.push(StepDefinition::Filter { predicate, steps });
        self
    }

    pub fn choice(
        mut self,
        when: Vec<WhenClause>,
        otherwise: Option<Vec<StepDefinition>>,
    ) -> Self {
        self.steps.push(StepDefinition::Choice { when, otherwise });
        self
    }

    pub fn split(mut self, expression: SplitExpression, steps: Vec<StepDefinition>) -> Self {
        self.steps.push(StepDefinition::Split { expression, steps });
        self
    }

    pub fn aggregate(mut self, definition: AggregateDefinition) -> Self {
        self.steps.push(StepDefinition::Aggregate(definition));
        self
    }

    pub fn resequence(mut self, definition: ResequenceDefinition) -> Self {
        self.steps.push(StepDefinition::Resequence(definition));
        self
    }

    pub fn idempotent(mut self, definition: IdempotentDefinition) -> Self {
        self.steps.push(StepDefinition::Idempotent(definition));
        self
    }

    pub fn log(mut self, message: impl Into<String>) -> Self {
        self.steps.push(StepDefinition::Log(message.into()));
        self
    }

    pub fn stop(mut self) -> Self {
        self.steps.push(StepDefinition::Stop);
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn error_handler(mut self, definition: ErrorHandlerDefinition) -> Self {
        self.error_handler = Some(definition);
        self
    }

    pub fn build(self) -> RouteDefinition {
        RouteDefinition {
            id: self.id,
            from: self.from,
            steps: self.steps,
            error_handler: self.error_handler,
        }
    }
}

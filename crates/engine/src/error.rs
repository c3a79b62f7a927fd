//! Engine error taxonomy
//!
//! Retryable conflicts, negative correlation results, definition and
//! consistency faults, and rejected failure wrapping are distinct variants.
//! Context (node, process, host) is layered on with [`EngineError::with_context`].

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::expression::ExpressionError;
use crate::model::FlowNodeInstance;
use crate::persistence::StoreError;

/// Context keys attached to failures
pub mod context_keys {
    pub const FLOW_NODE_ID: &str = "flow_node_id";
    pub const FLOW_NODE_NAME: &str = "flow_node_name";
    pub const PROCESS_DEFINITION_ID: &str = "process_definition_id";
    pub const PROCESS_INSTANCE_ID: &str = "process_instance_id";
    pub const ROOT_PROCESS_INSTANCE_ID: &str = "root_process_instance_id";
    pub const DESCRIPTION: &str = "description";
    pub const RECOVERY_PROCEDURE: &str = "recovery_procedure";
    pub const HOSTNAME: &str = "hostname";
    pub const THREAD: &str = "thread";
    pub const TENANT: &str = "tenant";
}

/// Key/value context accumulated while an error travels outward
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    entries: BTreeMap<&'static str, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps an existing value; inner layers know better
    pub fn insert(&mut self, key: &'static str, value: impl ToString) {
        self.entries.entry(key).or_insert_with(|| value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn merge(&mut self, other: ErrorContext) {
        for (key, value) in other.entries {
            self.entries.entry(key).or_insert(value);
        }
    }

    /// Identifiers of a flow node and its process
    pub fn for_node(node: &FlowNodeInstance) -> Self {
        use context_keys::*;
        let mut context = Self::new();
        context.insert(FLOW_NODE_ID, node.id);
        context.insert(FLOW_NODE_NAME, &node.name);
        context.insert(PROCESS_DEFINITION_ID, node.process_definition_id);
        context.insert(PROCESS_INSTANCE_ID, node.parent_process_instance_id);
        context.insert(ROOT_PROCESS_INSTANCE_ID, node.root_process_instance_id);
        context
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Errors raised by the execution core
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// No active waiting event matches; a normal negative result
    #[error("no waiting event matches {0}")]
    CorrelationNotFound(String),

    #[error("{count} waiting events match {key}")]
    AmbiguousCorrelation { key: String, count: usize },

    #[error("signal '{signal_name}' has no active target waiting event {waiting_event_id}")]
    TriggerTargetMissing {
        waiting_event_id: Uuid,
        signal_name: String,
    },

    #[error("definition error: {0}")]
    Definition(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    /// Breakpoint lookup failed; never retried, whatever the store reported
    #[error("breakpoint lookup failed: {0}")]
    Breakpoint(#[source] StoreError),

    /// A unit of work declined an operation, e.g. generic failure wrapping
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    #[error("{source} ({context})")]
    Execution {
        context: ErrorContext,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Optimistic conflicts are the only class worth re-running a unit for
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_conflict(),
            Self::Execution { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Store outages the dispatch layer may requeue
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Execution { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Add context, extending an existing context layer rather than nesting
    pub fn with_context(self, context: ErrorContext) -> Self {
        match self {
            Self::Execution {
                context: mut existing,
                source,
            } => {
                existing.merge(context);
                Self::Execution {
                    context: existing,
                    source,
                }
            }
            other => Self::Execution {
                context,
                source: Box::new(other),
            },
        }
    }

    /// Accumulated context, if any
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Execution { context, .. } => Some(context),
            _ => None,
        }
    }

    /// The error with all context and retry layers peeled off
    pub fn root_cause(&self) -> &EngineError {
        match self {
            Self::Execution { source, .. } | Self::RetriesExhausted { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict() -> EngineError {
        EngineError::Store(StoreError::ConcurrencyConflict {
            record: "flow_node".into(),
            expected: 1,
            actual: 2,
        })
    }

    #[test]
    fn test_retryable_survives_context() {
        let mut context = ErrorContext::new();
        context.insert(context_keys::FLOW_NODE_NAME, "merge");
        let err = conflict().with_context(context);
        assert!(err.is_retryable());
        assert!(!EngineError::Definition("x".into()).is_retryable());
    }

    #[test]
    fn test_exhausted_is_not_retryable() {
        let err = EngineError::RetriesExhausted {
            attempts: 3,
            source: Box::new(conflict()),
        };
        assert!(!err.is_retryable());
        assert!(matches!(err.root_cause(), EngineError::Store(_)));
    }

    #[test]
    fn test_context_accumulates_outward() {
        let mut inner = ErrorContext::new();
        inner.insert(context_keys::FLOW_NODE_NAME, "review");
        let mut outer = ErrorContext::new();
        outer.insert(context_keys::FLOW_NODE_NAME, "ignored");
        outer.insert(context_keys::TENANT, "acme");

        let err = EngineError::Consistency("broken".into())
            .with_context(inner)
            .with_context(outer);

        let context = err.context().unwrap();
        assert_eq!(context.get(context_keys::FLOW_NODE_NAME), Some("review"));
        assert_eq!(context.get(context_keys::TENANT), Some("acme"));
        assert!(matches!(err.root_cause(), EngineError::Consistency(_)));
        assert!(err.to_string().contains("tenant=acme"));
    }

    #[test]
    fn test_breakpoint_failures_are_final() {
        let err = EngineError::Breakpoint(StoreError::ConcurrencyConflict {
            record: "breakpoint".into(),
            expected: 1,
            actual: 2,
        });
        assert!(!err.is_retryable());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient() {
        let err = EngineError::Store(StoreError::Unavailable("down".into()))
            .with_context(ErrorContext::new());
        assert!(err.is_transient());
        assert!(!err.is_retryable());
    }
}

//! Expression evaluation
//!
//! Conditions, cardinalities and data assignments in a process definition are
//! expressions evaluated against a JSON scope. The engine only depends on the
//! [`ExpressionEvaluator`] trait; [`MinijinjaEvaluator`] is the bundled
//! implementation (minijinja expression syntax: `amount > 100 and approved`).

use serde_json::Value;

/// Variables visible to an expression
pub type Scope = serde_json::Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExpressionError {
    #[error("cannot evaluate `{expression}`: {message}")]
    Evaluation { expression: String, message: String },

    #[error("`{expression}` produced {value}, expected a boolean")]
    NotBoolean { expression: String, value: Value },

    #[error("`{expression}` produced {value}, expected a non-negative integer")]
    NotCount { expression: String, value: Value },
}

/// Evaluates definition expressions
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, ExpressionError>;

    /// Evaluate a condition; `null` (an undefined variable) counts as false
    fn evaluate_condition(&self, expression: &str, scope: &Scope) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, scope)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            value => Err(ExpressionError::NotBoolean {
                expression: expression.to_string(),
                value,
            }),
        }
    }

    fn evaluate_count(&self, expression: &str, scope: &Scope) -> Result<u32, ExpressionError> {
        let value = self.evaluate(expression, scope)?;
        value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ExpressionError::NotCount {
                expression: expression.to_string(),
                value,
            })
    }
}

/// minijinja-backed evaluator
#[derive(Debug, Clone, Default)]
pub struct MinijinjaEvaluator;

impl MinijinjaEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for MinijinjaEvaluator {
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, ExpressionError> {
        let failed = |e: &dyn std::fmt::Display| ExpressionError::Evaluation {
            expression: expression.to_string(),
            message: e.to_string(),
        };

        let env = minijinja::Environment::new();
        let compiled = env.compile_expression(expression).map_err(|e| failed(&e))?;
        let result = compiled.eval(scope).map_err(|e| failed(&e))?;
        if result.is_undefined() {
            return Ok(Value::Null);
        }
        serde_json::to_value(&result).map_err(|e| failed(&e))
    }
}

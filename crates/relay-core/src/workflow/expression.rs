//! Predicate evaluation for routing conditions.
//!
//! Conditions are JEXL expressions evaluated against a JSON context built
//! from the instance state. Output values are always passed as context and
//! never spliced into the expression text.
//!
//! Context shape:
//!
//! ```json
//! {
//!   "<output key>": <value>,          // every step output, at top level
//!   "outputs":   { "<key>": <value> },
//!   "decisions": [ { "stepId": "...", "chosenTarget": "...", ... } ],
//!   "attempts":  { "<step id>": 2 }
//! }
//! ```

use serde_json::{json, Value};

use crate::models::ExecutionInstance;

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

pub struct PredicateEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl PredicateEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("exists", |args: &[Value]| {
                Ok(json!(!matches!(args.first(), None | Some(Value::Null))))
            });

        Self { evaluator }
    }

    /// Evaluate `expression` and coerce the result with JavaScript-like
    /// truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;
        Ok(truthy(&result))
    }
}

impl Default for PredicateEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Build the evaluation context for an instance.
pub fn routing_context(instance: &ExecutionInstance) -> Value {
    let mut root = instance.step_outputs.clone();
    root.insert("outputs".to_string(), Value::Object(instance.step_outputs.clone()));
    root.insert("decisions".to_string(), json!(instance.decisions));
    root.insert("attempts".to_string(), json!(instance.attempts));
    Value::Object(root)
}

//! First-match conditional routing.

use crate::error::EngineError;
use crate::models::ExecutionInstance;
use crate::workflow::expression::{routing_context, PredicateEvaluator};
use crate::workflow::schema::RoutingStep;

/// Pick the next step for a routing step.
///
/// Conditions are tried in declared order and the first truthy one wins.
/// A predicate that fails to evaluate counts as no match. Falls back to the
/// default target, or [`EngineError::Unroutable`] when there is none.
pub fn route(
    evaluator: &PredicateEvaluator,
    instance: &ExecutionInstance,
    step: &RoutingStep,
) -> Result<String, EngineError> {
    let context = routing_context(instance);

    for condition in &step.conditions {
        match evaluator.evaluate_bool(&condition.when, &context) {
            Ok(true) => {
                tracing::info!(
                    "[Router] {} → {} (matched '{}')",
                    step.id,
                    condition.target,
                    condition.when
                );
                return Ok(condition.target.clone());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    "[Router] Condition '{}' on step {} treated as no match: {}",
                    condition.when,
                    step.id,
                    e
                );
            }
        }
    }

    match step.default {
        Some(ref target) => {
            tracing::info!("[Router] {} → {} (default)", step.id, target);
            Ok(target.clone())
        }
        None => Err(EngineError::Unroutable {
            step_id: step.id.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::Condition;
    use serde_json::json;

    fn gate(default: Option<&str>) -> RoutingStep {
        RoutingStep {
            id: "gate".into(),
            conditions: vec![
                Condition {
                    when: "score >= 8".into(),
                    target: "ship".into(),
                },
                Condition {
                    when: "score >= 5".into(),
                    target: "polish".into(),
                },
            ],
            default: default.map(String::from),
        }
    }

    fn instance_with_score(score: i64) -> ExecutionInstance {
        let mut inst = ExecutionInstance::new("i".into(), "wf".into(), None, "gate".into());
        inst.step_outputs.insert("score".into(), json!(score));
        inst
    }

    #[test]
    fn test_first_match_wins() {
        let eval = PredicateEvaluator::new();
        let step = gate(Some("revise"));
        assert_eq!(route(&eval, &instance_with_score(9), &step).unwrap(), "ship");
        assert_eq!(route(&eval, &instance_with_score(6), &step).unwrap(), "polish");
        assert_eq!(route(&eval, &instance_with_score(1), &step).unwrap(), "revise");
    }

    #[test]
    fn test_same_state_same_target() {
        let eval = PredicateEvaluator::new();
        let step = gate(Some("revise"));
        let inst = instance_with_score(8);
        let first = route(&eval, &inst, &step).unwrap();
        for _ in 0..5 {
            assert_eq!(route(&eval, &inst, &step).unwrap(), first);
        }
    }

    #[test]
    fn test_unroutable_without_default() {
        let eval = PredicateEvaluator::new();
        let err = route(&eval, &instance_with_score(1), &gate(None)).unwrap_err();
        assert!(matches!(err, EngineError::Unroutable { ref step_id } if step_id == "gate"));
    }

    #[test]
    fn test_eval_error_is_no_match() {
        let eval = PredicateEvaluator::new();
        let step = RoutingStep {
            id: "gate".into(),
            conditions: vec![
                Condition {
                    when: "score >=".into(),
                    target: "broken".into(),
                },
                Condition {
                    when: "true".into(),
                    target: "ok".into(),
                },
            ],
            default: None,
        };
        assert_eq!(route(&eval, &instance_with_score(1), &step).unwrap(), "ok");
    }
}

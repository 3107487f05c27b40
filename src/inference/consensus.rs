//! Agreement over replicated inference results.
//!
//! Replicas of the same task may return bit-different but equivalent
//! results (floating point noise, field ordering). The engine clusters
//! results by structural similarity and accepts a cluster once it reaches
//! the Byzantine agreement threshold. Falling short is a normal outcome
//! reported to the caller, not an error.

use serde_json::Value;
use std::collections::HashMap;

use crate::identity::NodeId;

/// Consensus evaluation over a set of `(node, result)` pairs.
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    /// Fraction of faulty responders tolerated
    byzantine_tolerance: f64,
    /// Relative difference under which two numbers count as equal
    numeric_tolerance: f64,
}

/// Outcome of one consensus evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusOutcome {
    /// A cluster met the threshold; `value` is its representative result.
    Agreed {
        value: Value,
        supporters: Vec<NodeId>,
    },
    /// No cluster met the threshold; cluster sizes are reported for logging.
    NotReached { clusters: Vec<usize> },
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self {
            byzantine_tolerance: 1.0 / 3.0,
            numeric_tolerance: 0.01,
        }
    }
}

impl ConsensusEngine {
    pub fn new(byzantine_tolerance: f64, numeric_tolerance: f64) -> Self {
        Self {
            byzantine_tolerance,
            numeric_tolerance,
        }
    }

    /// Minimum cluster size required for agreement among `n` responses.
    pub fn required_agreement(&self, n: usize) -> usize {
        let required = (n as f64 * (1.0 - self.byzantine_tolerance)).ceil() as usize;
        required.max(1)
    }

    /// Cluster results greedily and check the largest cluster against the
    /// agreement threshold.
    ///
    /// Each result joins the first existing cluster whose representative it
    /// is similar to, else starts its own. Pairwise-dissimilar results thus
    /// produce singleton clusters and no agreement.
    pub fn evaluate(&self, results: &[(NodeId, Value)]) -> ConsensusOutcome {
        let mut clusters: Vec<Vec<&(NodeId, Value)>> = Vec::new();

        for entry in results {
            match clusters
                .iter_mut()
                .find(|c| self.similar(&c[0].1, &entry.1))
            {
                Some(cluster) => cluster.push(entry),
                None => clusters.push(vec![entry]),
            }
        }

        let required = self.required_agreement(results.len());
        let winner = clusters.iter().max_by_key(|c| c.len());

        match winner {
            Some(cluster) if cluster.len() >= required => {
                let supporters: Vec<NodeId> =
                    cluster.iter().map(|(id, _)| id.clone()).collect();
                let values: Vec<&Value> = cluster.iter().map(|(_, v)| v).collect();
                tracing::debug!(
                    supporters = supporters.len(),
                    required,
                    "consensus reached"
                );
                ConsensusOutcome::Agreed {
                    value: representative(&values),
                    supporters,
                }
            }
            _ => {
                let sizes: Vec<usize> = clusters.iter().map(|c| c.len()).collect();
                tracing::debug!(clusters = ?sizes, required, "consensus not reached");
                ConsensusOutcome::NotReached { clusters: sizes }
            }
        }
    }

    /// Structural similarity between two results.
    ///
    /// Numbers compare by difference relative to the larger magnitude
    /// (absolute when one side is zero), objects need identical key sets
    /// with similar values, arrays identical length with pairwise-similar
    /// elements. Everything else is exact equality.
    fn similar(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) else {
                    return x == y;
                };
                if x == 0.0 && y == 0.0 {
                    return true;
                }
                if x == 0.0 || y == 0.0 {
                    return (x - y).abs() <= self.numeric_tolerance;
                }
                (x - y).abs() / x.abs().max(y.abs()) <= self.numeric_tolerance
            }
            (Value::Object(x), Value::Object(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(key, value)| {
                        y.get(key).is_some_and(|other| self.similar(value, other))
                    })
            }
            (Value::Array(x), Value::Array(y)) => {
                x.len() == y.len()
                    && x.iter().zip(y.iter()).all(|(v, w)| self.similar(v, w))
            }
            _ => a == b,
        }
    }
}

/// Representative value of an agreed cluster: arithmetic mean when every
/// member is numeric, otherwise the most frequent literal.
fn representative(values: &[&Value]) -> Value {
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
    if numbers.len() == values.len() && !numbers.is_empty() {
        let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
        return serde_json::Number::from_f64(mean)
            .map(Value::Number)
            .unwrap_or_else(|| values[0].clone());
    }

    let mut counts: HashMap<String, (usize, &Value)> = HashMap::new();
    for value in values {
        counts
            .entry(value.to_string())
            .and_modify(|(n, _)| *n += 1)
            .or_insert((1, value));
    }
    counts
        .into_values()
        .max_by_key(|(n, _)| *n)
        .map(|(_, v)| v.clone())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(values: &[Value]) -> Vec<(NodeId, Value)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (NodeId::new(format!("n{i}")), v.clone()))
            .collect()
    }

    #[test]
    fn test_required_agreement_two_of_three() {
        let engine = ConsensusEngine::default();
        assert_eq!(engine.required_agreement(3), 2);
        assert_eq!(engine.required_agreement(1), 1);
        assert_eq!(engine.required_agreement(5), 4);
    }

    #[test]
    fn test_two_of_three_agreement() {
        let engine = ConsensusEngine::default();
        let results = pairs(&[json!(0.90), json!(0.905), json!(0.10)]);

        match engine.evaluate(&results) {
            ConsensusOutcome::Agreed { supporters, value } => {
                assert_eq!(supporters.len(), 2);
                let v = value.as_f64().unwrap();
                assert!((v - 0.9025).abs() < 1e-9);
            }
            other => panic!("expected agreement, got {other:?}"),
        }
    }

    #[test]
    fn test_pairwise_dissimilar_rejected() {
        let engine = ConsensusEngine::default();
        let results = pairs(&[json!(0.1), json!(0.5), json!(0.9)]);

        match engine.evaluate(&results) {
            ConsensusOutcome::NotReached { clusters } => assert_eq!(clusters, vec![1, 1, 1]),
            other => panic!("expected no consensus, got {other:?}"),
        }
    }

    #[test]
    fn test_tolerance_uses_larger_magnitude_as_denominator() {
        let engine = ConsensusEngine::default();

        // |1.0 - 0.99005| / max = 0.00995 ≤ 0.01, but dividing by the
        // smaller value would give 0.01005 and wrongly reject the pair.
        let within = pairs(&[json!(1.0), json!(0.99005)]);
        assert!(matches!(
            engine.evaluate(&within),
            ConsensusOutcome::Agreed { .. }
        ));

        let past = pairs(&[json!(1.0), json!(0.9885)]);
        assert!(matches!(
            engine.evaluate(&past),
            ConsensusOutcome::NotReached { .. }
        ));
    }

    #[test]
    fn test_both_zero_are_similar() {
        let engine = ConsensusEngine::default();
        let results = pairs(&[json!(0.0), json!(0.0)]);
        assert!(matches!(
            engine.evaluate(&results),
            ConsensusOutcome::Agreed { .. }
        ));
    }

    #[test]
    fn test_zero_versus_nonzero_uses_absolute_difference() {
        let engine = ConsensusEngine::default();

        let close = pairs(&[json!(0.0), json!(0.005)]);
        assert!(matches!(
            engine.evaluate(&close),
            ConsensusOutcome::Agreed { .. }
        ));

        let far = pairs(&[json!(0.0), json!(0.5)]);
        assert!(matches!(
            engine.evaluate(&far),
            ConsensusOutcome::NotReached { .. }
        ));
    }

    #[test]
    fn test_object_similarity_requires_same_keys() {
        let engine = ConsensusEngine::default();

        let same_shape = pairs(&[
            json!({"score": 0.90, "label": "pos"}),
            json!({"score": 0.904, "label": "pos"}),
        ]);
        assert!(matches!(
            engine.evaluate(&same_shape),
            ConsensusOutcome::Agreed { .. }
        ));

        let different_shape = pairs(&[
            json!({"score": 0.90}),
            json!({"score": 0.90, "label": "pos"}),
        ]);
        assert!(matches!(
            engine.evaluate(&different_shape),
            ConsensusOutcome::NotReached { .. }
        ));
    }

    #[test]
    fn test_array_similarity_is_pairwise() {
        let engine = ConsensusEngine::default();
        let results = pairs(&[json!([0.1, 0.2]), json!([0.1005, 0.2005])]);
        assert!(matches!(
            engine.evaluate(&results),
            ConsensusOutcome::Agreed { .. }
        ));
    }

    #[test]
    fn test_two_of_three_labels_win() {
        let engine = ConsensusEngine::default();
        let results = pairs(&[json!("positive"), json!("positive"), json!("negative")]);

        match engine.evaluate(&results) {
            ConsensusOutcome::Agreed { value, supporters } => {
                assert_eq!(value, json!("positive"));
                assert_eq!(supporters.len(), 2);
            }
            other => panic!("expected agreement, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_types_never_similar() {
        let engine = ConsensusEngine::default();
        let results = pairs(&[json!(1.0), json!("1.0")]);
        assert!(matches!(
            engine.evaluate(&results),
            ConsensusOutcome::NotReached { .. }
        ));
    }

    #[test]
    fn test_empty_results_not_reached() {
        let engine = ConsensusEngine::default();
        assert_eq!(
            engine.evaluate(&[]),
            ConsensusOutcome::NotReached { clusters: vec![] }
        );
    }
}

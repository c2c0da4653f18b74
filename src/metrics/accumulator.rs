//! Append-only scalar metrics for a single policy update.
//!
//! The PPO update loop pushes one value per metric per micro-batch (or per
//! mini-batch for step-level metrics such as the gradient norm). The
//! accumulator is returned to the caller at the end of the update and
//! discarded; nothing is persisted here.

use std::collections::BTreeMap;

/// Ordered mapping from metric name to the sequence of values pushed so far.
///
/// Values keep their push order, which matches the micro-batch processing
/// order of the update loop. Names use a `scope/name` convention, e.g.
/// `actor/pg_loss`.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    values: BTreeMap<String, Vec<f32>>,
}

impl MetricsAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one value to a metric.
    pub fn push(&mut self, name: &str, value: f32) {
        self.values.entry(name.to_string()).or_default().push(value);
    }

    /// Append several `(name, value)` pairs at once.
    pub fn push_all(&mut self, entries: &[(&str, f32)]) {
        for (name, value) in entries {
            self.push(name, *value);
        }
    }

    /// Merge another accumulator into this one, preserving push order.
    pub fn merge(&mut self, other: MetricsAccumulator) {
        for (name, mut values) in other.values {
            self.values.entry(name).or_default().append(&mut values);
        }
    }

    /// All values pushed for a metric, or `None` if it was never pushed.
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    /// Mean of all values pushed for a metric.
    pub fn mean(&self, name: &str) -> Option<f32> {
        let values = self.values.get(name)?;
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }

    /// Number of distinct metric names.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no metric has been pushed.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consume the accumulator and return the underlying map.
    pub fn into_inner(self) -> BTreeMap<String, Vec<f32>> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_preserves_order() {
        let mut metrics = MetricsAccumulator::new();
        metrics.push("actor/pg_loss", 1.0);
        metrics.push("actor/pg_loss", 2.0);
        metrics.push("actor/pg_loss", 3.0);

        assert_eq!(metrics.get("actor/pg_loss"), Some(&[1.0, 2.0, 3.0][..]));
    }

    #[test]
    fn test_push_all() {
        let mut metrics = MetricsAccumulator::new();
        metrics.push_all(&[("a", 1.0), ("b", 2.0)]);
        metrics.push_all(&[("a", 3.0)]);

        assert_eq!(metrics.get("a"), Some(&[1.0, 3.0][..]));
        assert_eq!(metrics.get("b"), Some(&[2.0][..]));
        assert_eq!(metrics.len(), 2);
    }

    #[test]
    fn test_mean() {
        let mut metrics = MetricsAccumulator::new();
        metrics.push("kl", 0.0);
        metrics.push("kl", 2.0);

        assert!((metrics.mean("kl").unwrap() - 1.0).abs() < 1e-6);
        assert!(metrics.mean("missing").is_none());
    }

    #[test]
    fn test_merge_appends() {
        let mut a = MetricsAccumulator::new();
        a.push("x", 1.0);

        let mut b = MetricsAccumulator::new();
        b.push("x", 2.0);
        b.push("y", 3.0);

        a.merge(b);
        assert_eq!(a.get("x"), Some(&[1.0, 2.0][..]));
        assert_eq!(a.get("y"), Some(&[3.0][..]));
    }
}

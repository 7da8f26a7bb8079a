//! Aggregate accumulators shared by grouped evaluation and scatter merges.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::ast::Expr;
use super::eval::EvalError;
use crate::value::{CollatedKey, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    CountStar,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateKind {
    /// Kind of an aggregate call, `None` for anything else.
    pub fn of(expr: &Expr) -> Option<(AggregateKind, bool)> {
        let Expr::Function {
            name,
            distinct,
            star,
            ..
        } = expr
        else {
            return None;
        };
        let kind = match name.as_str() {
            "count" if *star => AggregateKind::CountStar,
            "count" => AggregateKind::Count,
            "sum" => AggregateKind::Sum,
            "min" => AggregateKind::Min,
            "max" => AggregateKind::Max,
            "avg" => AggregateKind::Avg,
            _ => return None,
        };
        Some((kind, *distinct))
    }

    /// How partial results of this kind combine across shards.
    pub fn merge_kind(self) -> Option<AggregateKind> {
        match self {
            AggregateKind::Count | AggregateKind::CountStar | AggregateKind::Sum => {
                Some(AggregateKind::Sum)
            }
            AggregateKind::Min => Some(AggregateKind::Min),
            AggregateKind::Max => Some(AggregateKind::Max),
            AggregateKind::Avg => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Accumulator {
    kind: AggregateKind,
    distinct: Option<BTreeSet<CollatedKey>>,
    count: i64,
    int_sum: Option<i64>,
    float_sum: Option<f64>,
    extreme: Option<Value>,
    /// Counts partials merge to a non-NULL zero even when empty.
    count_like: bool,
}

impl Accumulator {
    pub fn new(kind: AggregateKind, distinct: bool) -> Self {
        Self {
            kind,
            distinct: distinct.then(BTreeSet::new),
            count: 0,
            int_sum: None,
            float_sum: None,
            extreme: None,
            count_like: matches!(kind, AggregateKind::Count | AggregateKind::CountStar),
        }
    }

    /// Accumulator re-aggregating shard partials of `kind`.
    pub fn merging(kind: AggregateKind) -> Result<Self, EvalError> {
        let merge = kind.merge_kind().ok_or_else(|| {
            EvalError::Unsupported("avg across multiple shards".to_string())
        })?;
        let mut acc = Self::new(merge, false);
        acc.count_like = matches!(kind, AggregateKind::Count | AggregateKind::CountStar);
        Ok(acc)
    }

    /// Feeds one input value; `value` is ignored for `count(*)`.
    pub fn update(&mut self, value: &Value) -> Result<(), EvalError> {
        if self.kind == AggregateKind::CountStar {
            self.count += 1;
            return Ok(());
        }
        if value.is_null() {
            return Ok(());
        }
        if let Some(seen) = &mut self.distinct {
            if !seen.insert(CollatedKey(vec![value.clone()])) {
                return Ok(());
            }
        }
        self.count += 1;
        match self.kind {
            AggregateKind::Count | AggregateKind::CountStar => {}
            AggregateKind::Sum | AggregateKind::Avg => self.add(value)?,
            AggregateKind::Min => {
                if self
                    .extreme
                    .as_ref()
                    .map_or(true, |current| value.collate_cmp(current) == Ordering::Less)
                {
                    self.extreme = Some(value.clone());
                }
            }
            AggregateKind::Max => {
                if self
                    .extreme
                    .as_ref()
                    .map_or(true, |current| value.collate_cmp(current) == Ordering::Greater)
                {
                    self.extreme = Some(value.clone());
                }
            }
        }
        Ok(())
    }

    fn add(&mut self, value: &Value) -> Result<(), EvalError> {
        if let (Value::Int(v), None) = (value, self.float_sum) {
            let sum = self.int_sum.unwrap_or(0);
            match sum.checked_add(*v) {
                Some(next) => {
                    self.int_sum = Some(next);
                    return Ok(());
                }
                None => {
                    self.float_sum = Some(sum as f64);
                    self.int_sum = None;
                }
            }
        }
        let v = value
            .as_f64()
            .ok_or_else(|| EvalError::Type(format!("cannot sum non-numeric value '{value}'")))?;
        let base = self
            .float_sum
            .or_else(|| self.int_sum.map(|s| s as f64))
            .unwrap_or(0.0);
        self.float_sum = Some(base + v);
        self.int_sum = None;
        Ok(())
    }

    pub fn finish(&self) -> Value {
        match self.kind {
            AggregateKind::Count | AggregateKind::CountStar => Value::Int(self.count),
            AggregateKind::Sum => match (self.int_sum, self.float_sum) {
                (_, Some(f)) => Value::Float(f),
                (Some(i), None) => Value::Int(i),
                (None, None) if self.count_like => Value::Int(0),
                (None, None) => Value::Null,
            },
            AggregateKind::Avg => {
                if self.count == 0 {
                    return Value::Null;
                }
                let total = self
                    .float_sum
                    .or_else(|| self.int_sum.map(|s| s as f64))
                    .unwrap_or(0.0);
                Value::Float(total / self.count as f64)
            }
            AggregateKind::Min | AggregateKind::Max => {
                self.extreme.clone().unwrap_or(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_distinct_uses_collation() {
        let mut acc = Accumulator::new(AggregateKind::Count, true);
        for v in ["a", "A", "b", "a "] {
            acc.update(&Value::text(v)).expect("update");
        }
        acc.update(&Value::Null).expect("update");
        assert_eq!(acc.finish(), Value::Int(2));
    }

    #[test]
    fn sum_stays_integral_until_a_float_appears() {
        let mut acc = Accumulator::new(AggregateKind::Sum, false);
        acc.update(&Value::Int(2)).expect("update");
        acc.update(&Value::Int(3)).expect("update");
        assert_eq!(acc.finish(), Value::Int(5));
        acc.update(&Value::Float(0.5)).expect("update");
        assert_eq!(acc.finish(), Value::Float(5.5));
        assert_eq!(Accumulator::new(AggregateKind::Sum, false).finish(), Value::Null);
    }

    #[test]
    fn merged_counts_sum_partials() {
        let mut acc = Accumulator::merging(AggregateKind::Count).expect("mergeable");
        assert_eq!(acc.finish(), Value::Int(0));
        acc.update(&Value::Int(2)).expect("update");
        acc.update(&Value::Int(5)).expect("update");
        assert_eq!(acc.finish(), Value::Int(7));
        assert!(Accumulator::merging(AggregateKind::Avg).is_err());
    }

    #[test]
    fn min_max_follow_collation() {
        let mut min = Accumulator::new(AggregateKind::Min, false);
        let mut max = Accumulator::new(AggregateKind::Max, false);
        for v in ["b", "C", "a"] {
            min.update(&Value::text(v)).expect("update");
            max.update(&Value::text(v)).expect("update");
        }
        assert_eq!(min.finish(), Value::text("a"));
        assert_eq!(max.finish(), Value::text("C"));
    }
}

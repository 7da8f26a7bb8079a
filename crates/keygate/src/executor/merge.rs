//! Combining per-shard SELECT results.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BinaryHeap};

use crate::error::GateResult;
use crate::planner::{slot_name, AggregatePlan, KeyCol, Merge, SelectPlan, SlotMerge};
use crate::sql::aggregate::{Accumulator, AggregateKind};
use crate::sql::eval::{Scope, ScopeColumn};
use crate::sql::query::{evaluate_select, window_bound};
use crate::value::{BindVars, CollatedKey, Field, FieldType, QueryResult, Row, Value};

/// Merges shard results as the plan's `Merge` describes and drops the
/// hidden trailing columns.
pub(crate) fn merge_results(
    plan: &SelectPlan,
    results: Vec<QueryResult>,
    binds: &BindVars,
) -> GateResult<QueryResult> {
    let fields = results
        .first()
        .map(|r| r.fields.clone())
        .unwrap_or_default();
    let mut merged = match &plan.merge {
        Merge::Pass | Merge::Concat => {
            let mut out = QueryResult::with_fields(fields);
            for result in results {
                out.rows.extend(result.rows);
            }
            out
        }
        Merge::Ordered {
            keys,
            limit,
            offset,
        } => {
            let limit = window_bound(limit.as_ref(), binds)?;
            let offset = window_bound(offset.as_ref(), binds)?.unwrap_or(0);
            let projected = fields.len().saturating_sub(plan.hidden);
            let positions: Vec<(usize, bool)> = keys
                .iter()
                .map(|(col, desc)| match col {
                    KeyCol::At(idx) => (*idx, *desc),
                    KeyCol::Hidden(idx) => (projected + idx, *desc),
                })
                .collect();
            let rows = merge_sorted(results.into_iter().map(|r| r.rows).collect(), &positions);
            let window = rows.into_iter().skip(offset);
            let rows = match limit {
                Some(limit) => window.take(limit).collect(),
                None => window.collect(),
            };
            QueryResult {
                fields,
                rows,
                ..QueryResult::default()
            }
        }
        Merge::Aggregate(aggregate) => {
            return merge_aggregates(aggregate, &fields, results, binds);
        }
    };

    if plan.hidden > 0 {
        let keep = merged.fields.len().saturating_sub(plan.hidden);
        merged.fields.truncate(keep);
        for row in &mut merged.rows {
            row.truncate(keep);
        }
    }
    Ok(merged)
}

/// Head of one shard's sorted stream.
struct HeapEntry<'a> {
    key: Vec<Value>,
    desc: &'a [bool],
    source: usize,
    row: Row,
}

impl HeapEntry<'_> {
    fn order(&self, other: &Self) -> Ordering {
        for ((a, b), desc) in self.key.iter().zip(&other.key).zip(self.desc) {
            let ord = a.collate_cmp(b);
            let ord = if *desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        // Equal keys keep shard order so the merge is deterministic.
        self.source.cmp(&other.source)
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.order(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert to pop the smallest entry first.
        other.order(self)
    }
}

/// k-way merge of per-shard row lists that are each sorted on `keys`.
fn merge_sorted(sources: Vec<Vec<Row>>, keys: &[(usize, bool)]) -> Vec<Row> {
    let desc: Vec<bool> = keys.iter().map(|(_, d)| *d).collect();
    let key_of = |row: &Row| -> Vec<Value> {
        keys.iter()
            .map(|(idx, _)| row.get(*idx).cloned().unwrap_or(Value::Null))
            .collect()
    };
    let total = sources.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = sources.into_iter().map(Vec::into_iter).collect();
    let mut heap = BinaryHeap::with_capacity(iters.len());
    for (source, iter) in iters.iter_mut().enumerate() {
        if let Some(row) = iter.next() {
            heap.push(HeapEntry {
                key: key_of(&row),
                desc: &desc,
                source,
                row,
            });
        }
    }
    let mut out = Vec::with_capacity(total);
    while let Some(entry) = heap.pop() {
        let source = entry.source;
        out.push(entry.row);
        if let Some(row) = iters[source].next() {
            heap.push(HeapEntry {
                key: key_of(&row),
                desc: &desc,
                source,
                row,
            });
        }
    }
    out
}

/// Second aggregation pass: regroup shard partials, merge them, then run
/// the finalize select over the merged rows.
fn merge_aggregates(
    plan: &AggregatePlan,
    fields: &[Field],
    results: Vec<QueryResult>,
    binds: &BindVars,
) -> GateResult<QueryResult> {
    let fresh = || -> GateResult<Vec<Accumulator>> {
        plan.kinds
            .iter()
            .map(|kind| match kind {
                SlotMerge::Aggregate(kind) => Ok(Accumulator::merging(*kind)?),
                // Decision: bare columns outside the group key take the group's minimum.
                SlotMerge::Any => Ok(Accumulator::new(AggregateKind::Min, false)),
            })
            .collect()
    };

    let mut groups: BTreeMap<CollatedKey, Vec<Accumulator>> = BTreeMap::new();
    for result in results {
        for row in result.rows {
            let key = CollatedKey(row.iter().take(plan.group_slots).cloned().collect());
            let accumulators = match groups.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(fresh()?),
            };
            for (slot, acc) in accumulators.iter_mut().enumerate() {
                let value = row.get(plan.group_slots + slot).unwrap_or(&Value::Null);
                acc.update(value)?;
            }
        }
    }
    // An ungrouped aggregate over no rows still yields one row.
    if groups.is_empty() && plan.group_slots == 0 {
        groups.insert(CollatedKey(Vec::new()), fresh()?);
    }

    let width = plan.group_slots + plan.kinds.len();
    let scope = Scope {
        columns: (0..width)
            .map(|idx| ScopeColumn {
                table: None,
                name: slot_name(idx),
            })
            .collect(),
    };
    let types: Vec<FieldType> = (0..width)
        .map(|idx| fields.get(idx).map_or(FieldType::Null, |f| f.field_type))
        .collect();
    let rows = groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut row = key.0;
            row.extend(accumulators.iter().map(Accumulator::finish));
            row
        })
        .collect();
    Ok(evaluate_select(&plan.finalize, &scope, &types, rows, binds)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tests::plan_sql;
    use crate::planner::Plan;

    fn select_plan(sql: &str) -> SelectPlan {
        match plan_sql(sql).expect("plan") {
            Plan::Select(plan) => plan,
            other => panic!("expected select plan, got {other:?}"),
        }
    }

    fn shard(fields: &[&str], rows: Vec<Vec<Value>>) -> QueryResult {
        QueryResult {
            fields: fields
                .iter()
                .map(|name| Field::new(*name, FieldType::Int64))
                .collect(),
            rows,
            ..QueryResult::default()
        }
    }

    #[test]
    fn ordered_merge_applies_window_and_trims_hidden_keys() {
        let plan = select_plan("select id from users order by age desc, id limit 2 offset 1");
        assert_eq!(plan.hidden, 1);
        let a = shard(
            &["id", "age"],
            vec![
                vec![Value::Int(1), Value::Int(40)],
                vec![Value::Int(3), Value::Int(20)],
            ],
        );
        let b = shard(
            &["id", "age"],
            vec![
                vec![Value::Int(2), Value::Int(30)],
                vec![Value::Int(4), Value::Int(20)],
            ],
        );
        let merged = merge_results(&plan, vec![a, b], &BindVars::new()).expect("merge");
        assert_eq!(merged.field_names(), vec!["id"]);
        assert_eq!(merged.rows, vec![vec![Value::Int(2)], vec![Value::Int(3)]]);
    }

    #[test]
    fn aggregate_merge_sums_counts_and_keeps_extremes() {
        let plan = select_plan("select age, count(*), max(id) from users group by age");
        let a = shard(
            &["age", "count(*)", "max(id)"],
            vec![
                vec![Value::Int(20), Value::Int(2), Value::Int(7)],
                vec![Value::Int(30), Value::Int(1), Value::Int(3)],
            ],
        );
        let b = shard(
            &["age", "count(*)", "max(id)"],
            vec![vec![Value::Int(20), Value::Int(5), Value::Int(9)]],
        );
        let merged = merge_results(&plan, vec![a, b], &BindVars::new()).expect("merge");
        assert_eq!(
            merged.rows,
            vec![
                vec![Value::Int(20), Value::Int(7), Value::Int(9)],
                vec![Value::Int(30), Value::Int(1), Value::Int(3)],
            ]
        );
    }

    #[test]
    fn empty_scatter_count_is_zero() {
        let plan = select_plan("select count(*) from users");
        let merged = merge_results(
            &plan,
            vec![shard(&["count(*)"], Vec::new()), shard(&["count(*)"], Vec::new())],
            &BindVars::new(),
        )
        .expect("merge");
        assert_eq!(merged.rows, vec![vec![Value::Int(0)]]);
    }
}

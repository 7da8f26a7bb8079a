//! Splitting a full-table scan into independent range queries.
//!
//! Sharded keyspaces are cut along keyspace-id ranges that follow the shard
//! boundaries; the returned splits carry a key range for
//! `Gate::execute_key_ranges`. Unsharded keyspaces are cut along a numeric
//! column and the bounds travel as bind variables.

use crate::error::{GateError, GateResult};
use crate::key::KeyRange;
use crate::sql::ast::{BinaryOp, Expr, SelectItem, Statement};
use crate::value::{BindVars, Value};
use crate::vschema::VSchema;

pub const SPLIT_LOWER: &str = "_split_lower";
pub const SPLIT_UPPER: &str = "_split_upper";

#[derive(Clone, Debug)]
pub struct SplitOptions {
    pub split_count: usize,
    /// Column to cut unsharded tables along.
    pub split_column: Option<String>,
    /// Inclusive lower end of the split column's domain.
    pub min: Option<i64>,
    /// Inclusive upper end of the split column's domain.
    pub max: Option<i64>,
}

impl SplitOptions {
    pub fn new(split_count: usize) -> Self {
        Self {
            split_count,
            split_column: None,
            min: None,
            max: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QuerySplit {
    pub sql: String,
    pub binds: BindVars,
    pub keyspace: String,
    /// Set for sharded keyspaces.
    pub key_range: Option<KeyRange>,
}

/// Partitions `statement` into `opts.split_count` queries that together
/// read every row exactly once.
pub fn split_query(
    vschema: &VSchema,
    statement: &Statement,
    binds: &BindVars,
    target: Option<&str>,
    opts: &SplitOptions,
) -> GateResult<Vec<QuerySplit>> {
    let unsupported = || GateError::unsupported("split query");
    let Statement::Select(select) = statement else {
        return Err(unsupported());
    };
    let aggregated = select.projection.iter().any(|item| match item {
        SelectItem::Expr { expr, .. } => expr.contains_aggregate(),
        SelectItem::Wildcard(_) => false,
    });
    if select.from.len() != 1
        || aggregated
        || select.distinct
        || !select.group_by.is_empty()
        || select.having.is_some()
        || !select.order_by.is_empty()
        || select.limit.is_some()
        || select.offset.is_some()
    {
        return Err(unsupported());
    }
    if opts.split_count == 0 {
        return Err(GateError::Syntax("split count must be positive".to_string()));
    }

    let table = vschema.resolve_table(&select.from[0].table, target)?;
    let keyspace = vschema.keyspace(&table.keyspace)?;
    let count = opts.split_count;

    if keyspace.sharded {
        let sql = statement.to_string();
        let ranges = sharded_ranges(
            &keyspace
                .shards
                .iter()
                .map(|s| s.key_range.clone())
                .collect::<Vec<_>>(),
            count,
        );
        return Ok(ranges
            .into_iter()
            .map(|range| QuerySplit {
                sql: sql.clone(),
                binds: binds.clone(),
                keyspace: keyspace.name.clone(),
                key_range: Some(range),
            })
            .collect());
    }

    let column = opts
        .split_column
        .clone()
        .or_else(|| table.primary().and_then(|p| p.columns.first().cloned()))
        .unwrap_or_else(|| "id".to_string());
    let min = opts.min.unwrap_or(i64::MIN);
    let max = opts.max.unwrap_or(i64::MAX);
    if min > max {
        return Err(GateError::Syntax(format!(
            "split range is empty: {min} > {max}"
        )));
    }
    let bounds = interval_bounds(min, max, count);
    let mut splits = Vec::with_capacity(count);
    for idx in 0..count {
        let mut select = select.clone();
        let mut split_binds = binds.clone();
        let mut filters = Vec::new();
        if idx > 0 {
            filters.push(Expr::binary(
                Expr::column(column.clone()),
                BinaryOp::GtEq,
                Expr::BindVar(SPLIT_LOWER.to_string()),
            ));
            split_binds.insert(SPLIT_LOWER.to_string(), Value::Int(bounds[idx - 1]));
        }
        if idx + 1 < count {
            filters.push(Expr::binary(
                Expr::column(column.clone()),
                BinaryOp::Lt,
                Expr::BindVar(SPLIT_UPPER.to_string()),
            ));
            split_binds.insert(SPLIT_UPPER.to_string(), Value::Int(bounds[idx]));
        }
        if let Some(filter) = Expr::conjoin(filters) {
            select.selection = Some(Expr::and_opt(select.selection.take(), filter));
        }
        splits.push(QuerySplit {
            sql: Statement::Select(select).to_string(),
            binds: split_binds,
            keyspace: keyspace.name.clone(),
            key_range: None,
        });
    }
    Ok(splits)
}

/// `count - 1` interior cut points of `[min, max]`.
fn interval_bounds(min: i64, max: i64, count: usize) -> Vec<i64> {
    let span = i128::from(max) - i128::from(min) + 1;
    let count = count as i128;
    (1..count)
        .map(|idx| {
            let cut = i128::from(min) + span * idx / count;
            cut.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
        })
        .collect()
}

/// Key ranges of `count` splits over shards given in key order.
fn sharded_ranges(shards: &[KeyRange], count: usize) -> Vec<KeyRange> {
    let total = shards.len();
    if total == 0 {
        return Vec::new();
    }
    if count <= total {
        let base = total / count;
        let extra = total % count;
        let mut out = Vec::with_capacity(count);
        let mut next = 0;
        for group in 0..count {
            let size = base + usize::from(group < extra);
            let first = &shards[next];
            let last = &shards[next + size - 1];
            out.push(KeyRange::from_bounds(first.start_u128(), last.end_u128()));
            next += size;
        }
        return out;
    }

    let base = count / total;
    let extra = count % total;
    let mut out = Vec::with_capacity(count);
    for (idx, shard) in shards.iter().enumerate() {
        let parts = (base + usize::from(idx < extra)) as u128;
        let start = shard.start_u128();
        let width = shard.end_u128() - start;
        for part in 0..parts {
            let lo = start + width * part / parts;
            let hi = if part + 1 == parts {
                shard.end_u128()
            } else {
                start + width * (part + 1) / parts
            };
            out.push(KeyRange::from_bounds(lo, hi));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tests::test_vschema;
    use crate::sql::parse::parse_statement;

    fn split(sql: &str, opts: SplitOptions) -> GateResult<Vec<QuerySplit>> {
        let statement = parse_statement(sql)?;
        split_query(&test_vschema(), &statement, &BindVars::new(), None, &opts)
    }

    fn assert_contiguous(ranges: &[KeyRange]) {
        assert_eq!(ranges.first().map(KeyRange::start_u128), Some(0));
        assert_eq!(ranges.last().map(KeyRange::end_u128), Some(1u128 << 64));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end_u128(), pair[1].start_u128());
        }
    }

    #[test]
    fn sharded_splits_follow_shard_boundaries() {
        let splits = split("select * from users", SplitOptions::new(2)).expect("split");
        let ranges: Vec<KeyRange> = splits.iter().filter_map(|s| s.key_range.clone()).collect();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].to_string(), "-80");
        assert_eq!(ranges[1].to_string(), "80-");
        assert!(splits.iter().all(|s| s.sql == "select * from users"));

        let one = split("select * from users", SplitOptions::new(1)).expect("split");
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].key_range.as_ref().map(KeyRange::is_full), Some(true));
    }

    #[test]
    fn sharded_splits_subdivide_shards() {
        let splits = split("select id from users where age > 3", SplitOptions::new(5)).expect("split");
        let ranges: Vec<KeyRange> = splits.into_iter().filter_map(|s| s.key_range).collect();
        assert_eq!(ranges.len(), 5);
        assert_contiguous(&ranges);
        // The first shard takes the extra part.
        assert_eq!(ranges[2].end_u128(), 1u128 << 63);
    }

    #[test]
    fn unsharded_splits_bind_bounds() {
        let mut opts = SplitOptions::new(3);
        opts.split_column = Some("name".to_string());
        opts.min = Some(0);
        opts.max = Some(299);
        let splits = split("select * from name_map", opts).expect("split");
        assert_eq!(splits.len(), 3);
        assert_eq!(splits[0].sql, "select * from name_map where name < :_split_upper");
        assert_eq!(splits[0].binds.get(SPLIT_UPPER), Some(&Value::Int(100)));
        assert_eq!(
            splits[1].sql,
            "select * from name_map where name >= :_split_lower and name < :_split_upper"
        );
        assert_eq!(splits[1].binds.get(SPLIT_LOWER), Some(&Value::Int(100)));
        assert_eq!(splits[1].binds.get(SPLIT_UPPER), Some(&Value::Int(200)));
        assert_eq!(splits[2].sql, "select * from name_map where name >= :_split_lower");
        assert!(splits[2].binds.get(SPLIT_UPPER).is_none());
    }

    #[test]
    fn unsplittable_shapes_are_rejected() {
        for sql in [
            "select count(*) from users",
            "select * from users order by id",
            "select * from users limit 3",
            "select * from users u join orders o on u.id = o.user_id",
        ] {
            let err = split(sql, SplitOptions::new(2)).expect_err(sql);
            assert_eq!(err.to_string(), "unsupported: split query", "{sql}");
        }
    }
}

//! SELECT planning: single-table routes and their merge strategy, router-side
//! joins, subqueries and vindex function reads.

use std::sync::Arc;

use super::route::{is_column_of, route_for};
use super::{
    shard_table_name, AggregatePlan, JoinDriver, JoinPlan, JoinTable, KeyCol, Merge, Plan,
    SelectPlan, SlotMerge, SubqueryPlan, VindexColumn, VindexFuncPlan,
};
use crate::error::{GateError, GateResult};
use crate::sql::aggregate::AggregateKind;
use crate::sql::ast::{BinaryOp, Expr, JoinKind, OrderBy, Select, SelectItem};
use crate::value::Value;
use crate::vindex::Vindex;
use crate::vschema::{Table, VSchema};

pub(crate) fn plan_select(select: &Select, vschema: &VSchema, target: Option<&str>) -> GateResult<Plan> {
    if select.from.is_empty() {
        return plan_dual(select, vschema, target);
    }
    let subqueries = collect_subqueries(select)?;
    if !subqueries.is_empty() {
        let mut inner = Vec::with_capacity(subqueries.len());
        for subquery in subqueries {
            if subquery.projection.len() != 1
                || matches!(subquery.projection[0], SelectItem::Wildcard(_))
            {
                return Err(GateError::unsupported("subquery must return exactly one column"));
            }
            inner.push(plan_select(subquery, vschema, target)?);
        }
        return Ok(Plan::Subquery(SubqueryPlan {
            select: Box::new(select.clone()),
            inner,
            target: target.map(str::to_string),
        }));
    }
    if select.from.len() > 1 {
        return plan_join(select, vschema, target);
    }
    plan_single(select, vschema, target)
}

/// Table-less selects go to the target keyspace, else to an unsharded one,
/// else to the first keyspace, so shard timeouts and warnings still apply.
fn plan_dual(select: &Select, vschema: &VSchema, target: Option<&str>) -> GateResult<Plan> {
    let keyspace = match target {
        Some(name) => vschema.keyspace(name)?,
        None => vschema
            .keyspaces()
            .find(|ks| !ks.sharded)
            .or_else(|| vschema.keyspaces().next())
            .cloned()
            .ok_or_else(|| GateError::schema("vschema declares no keyspaces"))?,
    };
    Ok(Plan::Dual {
        keyspace,
        query: Box::new(select.clone()),
    })
}

fn has_subquery(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |node| {
        if matches!(node, Expr::InSubquery { .. }) {
            found = true;
        }
    });
    found
}

/// Subqueries of the WHERE clause in pre-order. Anywhere else they are
/// rejected.
fn collect_subqueries(select: &Select) -> GateResult<Vec<&Select>> {
    let elsewhere = select.projection.iter().any(|item| match item {
        SelectItem::Expr { expr, .. } => has_subquery(expr),
        SelectItem::Wildcard(_) => false,
    }) || select.having.as_ref().is_some_and(has_subquery)
        || select.group_by.iter().any(has_subquery)
        || select.order_by.iter().any(|o| has_subquery(&o.expr))
        || select.from.iter().any(|t| t.on.as_ref().is_some_and(has_subquery));
    if elsewhere {
        return Err(GateError::unsupported("subquery outside the WHERE clause"));
    }
    let mut subqueries = Vec::new();
    if let Some(selection) = &select.selection {
        gather_subqueries(selection, &mut subqueries);
    }
    Ok(subqueries)
}

fn gather_subqueries<'a>(expr: &'a Expr, out: &mut Vec<&'a Select>) {
    match expr {
        Expr::InSubquery { subquery, .. } => out.push(subquery),
        Expr::Binary { left, right, .. } => {
            gather_subqueries(left, out);
            gather_subqueries(right, out);
        }
        Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => gather_subqueries(expr, out),
        Expr::InList { expr, list, .. } => {
            gather_subqueries(expr, out);
            for item in list {
                gather_subqueries(item, out);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            gather_subqueries(expr, out);
            gather_subqueries(low, out);
            gather_subqueries(high, out);
        }
        Expr::Like { expr, pattern, .. } => {
            gather_subqueries(expr, out);
            gather_subqueries(pattern, out);
        }
        Expr::Function { args, .. } | Expr::Tuple(args) => {
            for arg in args {
                gather_subqueries(arg, out);
            }
        }
        Expr::Column(_) | Expr::Literal(_) | Expr::BindVar(_) | Expr::ListArg(_) => {}
    }
}

fn plan_single(select: &Select, vschema: &VSchema, target: Option<&str>) -> GateResult<Plan> {
    let from = &select.from[0];
    let table = match vschema.resolve_table(&from.table, target) {
        Ok(table) => table,
        Err(err) => {
            return match vschema.resolve_vindex(&from.table, target) {
                Some(vindex) => plan_vindex_func(select, vindex),
                None => Err(err),
            }
        }
    };
    let keyspace = vschema.keyspace(&table.keyspace)?;
    let reference = from.reference_name().to_string();

    let mut query = select.clone();
    query.from[0].table = shard_table_name(&from.table);
    let route = route_for(&table, keyspace, &reference, query.selection.as_mut());

    if route.is_single_shard() {
        return Ok(Plan::Select(SelectPlan {
            route,
            table,
            query,
            merge: Merge::Pass,
            hidden: 0,
        }));
    }
    let aggregated = select.distinct
        || select.having.is_some()
        || !select.group_by.is_empty()
        || select.projection.iter().any(|item| match item {
            SelectItem::Expr { expr, .. } => expr.contains_aggregate(),
            SelectItem::Wildcard(_) => false,
        });
    if aggregated {
        return plan_aggregate(select, route, table, query);
    }
    if !select.order_by.is_empty() || select.limit.is_some() || select.offset.is_some() {
        return plan_ordered(select, route, table, query);
    }
    Ok(Plan::Select(SelectPlan {
        route,
        table,
        query,
        merge: Merge::Concat,
        hidden: 0,
    }))
}

/// Same expression, treating an unqualified column as matching a qualified
/// one of the same name.
fn same_expr(a: &Expr, b: &Expr) -> bool {
    match (a, b) {
        (Expr::Column(x), Expr::Column(y)) => {
            x.name.eq_ignore_ascii_case(&y.name)
                && match (&x.table, &y.table) {
                    (Some(p), Some(q)) => p.eq_ignore_ascii_case(q),
                    _ => true,
                }
        }
        _ => a.to_string().eq_ignore_ascii_case(&b.to_string()),
    }
}

/// Projected expression an unqualified column names through its alias.
fn alias_target<'a>(projection: &'a [SelectItem], expr: &Expr) -> Option<(usize, &'a Expr)> {
    let Expr::Column(column) = expr else {
        return None;
    };
    if column.table.is_some() {
        return None;
    }
    projection.iter().enumerate().find_map(|(idx, item)| match item {
        SelectItem::Expr {
            expr,
            alias: Some(alias),
        } if alias.eq_ignore_ascii_case(&column.name) => Some((idx, expr)),
        _ => None,
    })
}

fn ordinal(expr: &Expr, len: usize, clause: &str) -> GateResult<Option<usize>> {
    let Expr::Literal(Value::Int(n)) = expr else {
        return Ok(None);
    };
    match usize::try_from(*n) {
        Ok(n) if (1..=len).contains(&n) => Ok(Some(n - 1)),
        _ => Err(GateError::schema(format!("Unknown column '{n}' in '{clause}'"))),
    }
}

fn plan_ordered(
    select: &Select,
    route: super::Route,
    table: Arc<Table>,
    mut query: Select,
) -> GateResult<Plan> {
    let wildcard = query
        .projection
        .iter()
        .any(|item| matches!(item, SelectItem::Wildcard(_)));
    let mut keys = Vec::with_capacity(select.order_by.len());
    let mut hidden = 0;
    for order in &select.order_by {
        let position = if wildcard {
            if matches!(order.expr, Expr::Literal(Value::Int(_))) {
                return Err(GateError::unsupported(
                    "order by position with a wildcard projection across shards",
                ));
            }
            None
        } else {
            match ordinal(&order.expr, select.projection.len(), "order clause")? {
                Some(idx) => Some(idx),
                None => alias_target(&select.projection, &order.expr)
                    .map(|(idx, _)| idx)
                    .or_else(|| {
                        select.projection.iter().position(|item| match item {
                            SelectItem::Expr { expr, .. } => same_expr(expr, &order.expr),
                            SelectItem::Wildcard(_) => false,
                        })
                    }),
            }
        };
        let column = match position {
            Some(idx) => KeyCol::At(idx),
            None => {
                let expr = alias_target(&select.projection, &order.expr)
                    .map(|(_, expr)| expr.clone())
                    .unwrap_or_else(|| order.expr.clone());
                query.projection.push(SelectItem::Expr { expr, alias: None });
                hidden += 1;
                KeyCol::Hidden(hidden - 1)
            }
        };
        keys.push((column, order.desc));
    }
    // Shards return the first offset+limit rows; the limit is bound at
    // execution time.
    query.offset = None;
    Ok(Plan::Select(SelectPlan {
        route,
        table,
        query,
        merge: Merge::Ordered {
            keys,
            limit: select.limit.clone(),
            offset: select.offset.clone(),
        },
        hidden,
    }))
}

/// Name of a merged column in the finalize pass.
pub(crate) fn slot_name(idx: usize) -> String {
    format!("#{idx}")
}

/// Shard projection for an aggregate route: the group key first, then
/// aggregate partials and bare columns.
struct Slots {
    exprs: Vec<Expr>,
    group_count: usize,
    kinds: Vec<SlotMerge>,
}

impl Slots {
    fn slot_for(&mut self, node: &Expr) -> GateResult<Option<usize>> {
        if let Some(idx) = self.exprs[..self.group_count]
            .iter()
            .position(|g| same_expr(g, node))
        {
            return Ok(Some(idx));
        }
        let merge = if let Some((kind, distinct)) = AggregateKind::of(node) {
            if kind == AggregateKind::Avg {
                return Err(GateError::unsupported("avg across multiple shards"));
            }
            if distinct && !matches!(kind, AggregateKind::Min | AggregateKind::Max) {
                return Err(GateError::unsupported(format!(
                    "{node} across multiple shards"
                )));
            }
            SlotMerge::Aggregate(kind)
        } else if matches!(node, Expr::Column(_)) {
            SlotMerge::Any
        } else {
            return Ok(None);
        };
        let existing = self.exprs[self.group_count..]
            .iter()
            .zip(&self.kinds)
            .position(|(expr, kind)| *kind == merge && same_expr(expr, node));
        if let Some(idx) = existing {
            return Ok(Some(self.group_count + idx));
        }
        self.exprs.push(node.clone());
        self.kinds.push(merge);
        Ok(Some(self.exprs.len() - 1))
    }

    /// Rewrites `expr` over slot columns.
    fn replace(&mut self, expr: &mut Expr) -> GateResult<()> {
        let mut failure = None;
        expr.substitute(&mut |node| {
            if failure.is_some() {
                return None;
            }
            match self.slot_for(node) {
                Ok(Some(idx)) => Some(Expr::column(slot_name(idx))),
                Ok(None) => None,
                Err(err) => {
                    failure = Some(err);
                    None
                }
            }
        });
        failure.map_or(Ok(()), Err)
    }
}

/// Replaces unqualified alias references with the aliased expression.
fn expand_aliases(expr: &Expr, projection: &[SelectItem]) -> Expr {
    let mut out = expr.clone();
    out.substitute(&mut |node| alias_target(projection, node).map(|(_, target)| target.clone()));
    out
}

fn plan_aggregate(
    select: &Select,
    route: super::Route,
    table: Arc<Table>,
    mut query: Select,
) -> GateResult<Plan> {
    let mut outputs = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        match item {
            SelectItem::Expr { expr, .. } => {
                outputs.push((expr.clone(), item.output_name().unwrap_or_default()))
            }
            SelectItem::Wildcard(_) => {
                return Err(GateError::unsupported(
                    "wildcard in an aggregate query across shards",
                ))
            }
        }
    }
    let has_aggregates = outputs.iter().any(|(expr, _)| expr.contains_aggregate());

    let mut groups = Vec::with_capacity(select.group_by.len());
    for expr in &select.group_by {
        let resolved = match ordinal(expr, outputs.len(), "group statement")? {
            Some(idx) => outputs[idx].0.clone(),
            None => match alias_target(&select.projection, expr) {
                Some((_, target)) if !target.contains_aggregate() => target.clone(),
                _ => expr.clone(),
            },
        };
        groups.push(resolved);
    }
    // DISTINCT without aggregates is a GROUP BY over every output column.
    let distinct_as_groups = select.distinct && groups.is_empty() && !has_aggregates;
    if distinct_as_groups {
        groups = outputs.iter().map(|(expr, _)| expr.clone()).collect();
    }

    let mut slots = Slots {
        group_count: groups.len(),
        exprs: groups.clone(),
        kinds: Vec::new(),
    };

    let mut projection = Vec::with_capacity(outputs.len());
    for (expr, name) in &outputs {
        let mut expr = expr.clone();
        slots.replace(&mut expr)?;
        projection.push(SelectItem::Expr {
            expr,
            alias: Some(name.clone()),
        });
    }
    let selection = match &select.having {
        Some(having) => {
            let mut having = expand_aliases(having, &select.projection);
            slots.replace(&mut having)?;
            Some(having)
        }
        None => None,
    };
    let mut order_by = Vec::with_capacity(select.order_by.len());
    for order in &select.order_by {
        let expr = if ordinal(&order.expr, outputs.len(), "order clause")?.is_some() {
            order.expr.clone()
        } else if let Some((idx, _)) = alias_target(&select.projection, &order.expr) {
            Expr::Literal(Value::Int(idx as i64 + 1))
        } else {
            let mut expr = order.expr.clone();
            slots.replace(&mut expr)?;
            expr
        };
        order_by.push(OrderBy {
            expr,
            desc: order.desc,
        });
    }

    let finalize = Select {
        distinct: select.distinct && !distinct_as_groups,
        projection,
        from: Vec::new(),
        selection,
        group_by: Vec::new(),
        having: None,
        order_by,
        limit: select.limit.clone(),
        offset: select.offset.clone(),
        lock: None,
    };

    query.distinct = false;
    query.projection = slots
        .exprs
        .iter()
        .map(|expr| SelectItem::Expr {
            expr: expr.clone(),
            alias: None,
        })
        .collect();
    query.group_by = groups;
    query.having = None;
    query.order_by.clear();
    query.limit = None;
    query.offset = None;

    Ok(Plan::Select(SelectPlan {
        route,
        table,
        query,
        merge: Merge::Aggregate(AggregatePlan {
            group_slots: slots.group_count,
            kinds: slots.kinds,
            finalize,
        }),
        hidden: 0,
    }))
}

/// True when every column of `expr` is qualified with `reference`.
fn only_references(expr: &Expr, reference: &str) -> bool {
    let qualifiers = expr.column_qualifiers();
    !qualifiers.is_empty()
        && qualifiers
            .iter()
            .all(|q| q.as_deref().is_some_and(|q| q.eq_ignore_ascii_case(reference)))
}

/// True when every column of `expr` is qualified with one of `earlier`.
fn only_earlier(expr: &Expr, earlier: &[String]) -> bool {
    let qualifiers = expr.column_qualifiers();
    !qualifiers.is_empty()
        && qualifiers.iter().all(|q| {
            q.as_deref()
                .is_some_and(|q| earlier.iter().any(|e| e.eq_ignore_ascii_case(q)))
        })
}

fn driver_of(conjunct: &Expr, reference: &str, earlier: &[String]) -> Option<JoinDriver> {
    let Expr::Binary {
        left,
        op: BinaryOp::Eq,
        right,
    } = conjunct
    else {
        return None;
    };
    for (inner, outer) in [(left, right), (right, left)] {
        let Some(column) = inner.as_column() else {
            continue;
        };
        let own = column
            .table
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(reference));
        if own && only_earlier(outer, earlier) {
            return Some(JoinDriver {
                column: column.name.clone(),
                outer: (**outer).clone(),
            });
        }
    }
    None
}

fn plan_join(select: &Select, vschema: &VSchema, target: Option<&str>) -> GateResult<Plan> {
    let aggregated = !select.group_by.is_empty()
        || select.having.is_some()
        || select.projection.iter().any(|item| match item {
            SelectItem::Expr { expr, .. } => expr.contains_aggregate(),
            SelectItem::Wildcard(_) => false,
        });
    if aggregated {
        return Err(GateError::unsupported("aggregation on top of a cross-shard join"));
    }

    let where_conjuncts: Vec<Expr> = select
        .selection
        .as_ref()
        .map(|s| s.conjuncts().into_iter().cloned().collect())
        .unwrap_or_default();
    let mut earlier: Vec<String> = Vec::new();
    let mut tables = Vec::with_capacity(select.from.len());
    for (idx, from) in select.from.iter().enumerate() {
        let table = vschema.resolve_table(&from.table, target)?;
        let reference = from.reference_name().to_string();
        if earlier.iter().any(|e| e.eq_ignore_ascii_case(&reference)) {
            return Err(GateError::schema(format!("Not unique table/alias: '{reference}'")));
        }
        let on_conjuncts: Vec<Expr> = from
            .on
            .as_ref()
            .map(|on| on.conjuncts().into_iter().cloned().collect())
            .unwrap_or_default();
        // WHERE filters cannot move below the inner side of a LEFT join.
        let where_applies = idx == 0 || from.join == JoinKind::Inner;

        let mut local: Vec<Expr> = on_conjuncts
            .iter()
            .filter(|c| idx > 0 && only_references(c, &reference))
            .cloned()
            .collect();
        if where_applies {
            local.extend(
                where_conjuncts
                    .iter()
                    .filter(|c| only_references(c, &reference))
                    .cloned(),
            );
        }
        let driver = if idx == 0 {
            None
        } else {
            on_conjuncts
                .iter()
                .chain(where_conjuncts.iter().filter(|_| where_applies))
                .find_map(|c| driver_of(c, &reference, &earlier))
        };

        tables.push(JoinTable {
            table: table.qualified_name(),
            reference: reference.clone(),
            kind: from.join,
            on: from.on.clone(),
            local: Expr::conjoin(local),
            driver,
        });
        earlier.push(reference);
    }
    Ok(Plan::Join(JoinPlan {
        select: Box::new(select.clone()),
        tables,
    }))
}

fn plan_vindex_func(select: &Select, vindex: Arc<Vindex>) -> GateResult<Plan> {
    if vindex.arity() != 1 {
        return Err(GateError::unsupported(format!(
            "vindex function on multi-column vindex {}",
            vindex.name
        )));
    }
    if !select.group_by.is_empty() || !select.order_by.is_empty() || select.having.is_some() {
        return Err(GateError::unsupported("clauses other than WHERE on a vindex function"));
    }
    let reference = select.from[0].reference_name().to_string();

    let mut columns = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => {
                columns.push(("id".to_string(), VindexColumn::Id));
                columns.push(("keyspace_id".to_string(), VindexColumn::KeyspaceId));
            }
            SelectItem::Expr {
                expr: Expr::Column(column),
                alias,
            } => {
                let kind = match column.name.to_ascii_lowercase().as_str() {
                    "id" => VindexColumn::Id,
                    "keyspace_id" => VindexColumn::KeyspaceId,
                    _ => {
                        return Err(GateError::schema(format!(
                            "unknown column {} in vindex {}",
                            column.name, vindex.name
                        )))
                    }
                };
                columns.push((alias.clone().unwrap_or_else(|| column.name.clone()), kind));
            }
            SelectItem::Expr { expr, .. } => {
                return Err(GateError::unsupported(format!(
                    "expression {expr} on a vindex function"
                )))
            }
        }
    }

    let shape_error = || {
        GateError::unsupported(
            "where clause for vindex function must be of the form id = <val> or id in (<val>,...)",
        )
    };
    let values = match &select.selection {
        Some(Expr::Binary {
            left,
            op: BinaryOp::Eq,
            right,
        }) => {
            if is_column_of(left, "id", &reference, &vindex.name) && right.is_value() {
                vec![(**right).clone()]
            } else if is_column_of(right, "id", &reference, &vindex.name) && left.is_value() {
                vec![(**left).clone()]
            } else {
                return Err(shape_error());
            }
        }
        Some(Expr::InList {
            expr,
            list,
            negated: false,
        }) if is_column_of(expr, "id", &reference, &vindex.name) && list.iter().all(Expr::is_value) => {
            list.clone()
        }
        _ => return Err(shape_error()),
    };
    Ok(Plan::VindexFunc(VindexFuncPlan {
        vindex,
        values,
        columns,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tests::plan_sql;

    fn select_plan(sql: &str) -> SelectPlan {
        match plan_sql(sql).unwrap_or_else(|err| panic!("{sql}: {err}")) {
            Plan::Select(plan) => plan,
            other => panic!("expected select plan, got {:?}", other.kind()),
        }
    }

    #[test]
    fn ordered_scatter_adds_hidden_keys_and_drops_offset() {
        let plan = select_plan("select id from users order by name desc, id limit 2 offset 3");
        assert_eq!(
            plan.query.to_string(),
            "select id, name from users order by name desc, id asc limit 2"
        );
        assert_eq!(plan.hidden, 1);
        let Merge::Ordered { keys, limit, offset } = plan.merge else {
            panic!("expected ordered merge");
        };
        assert_eq!(keys, vec![(KeyCol::Hidden(0), true), (KeyCol::At(0), false)]);
        assert_eq!(limit, Some(Expr::literal(2i64)));
        assert_eq!(offset, Some(Expr::literal(3i64)));
    }

    #[test]
    fn aggregate_scatter_splits_partials_from_finalize() {
        let plan = select_plan(
            "select name, count(*) as c from users group by name having c > 1 order by c desc",
        );
        assert_eq!(
            plan.query.to_string(),
            "select name, count(*) from users group by name"
        );
        let Merge::Aggregate(aggregate) = plan.merge else {
            panic!("expected aggregate merge");
        };
        assert_eq!(aggregate.group_slots, 1);
        assert_eq!(aggregate.kinds, vec![SlotMerge::Aggregate(AggregateKind::CountStar)]);
        let finalize = &aggregate.finalize;
        assert_eq!(finalize.projection[1].output_name().as_deref(), Some("c"));
        assert_eq!(finalize.selection, Some(Expr::binary(
            Expr::column("#1"),
            BinaryOp::Gt,
            Expr::literal(1i64),
        )));
        assert_eq!(finalize.order_by[0].expr, Expr::literal(2i64));
    }

    #[test]
    fn distinct_becomes_group_by() {
        let plan = select_plan("select distinct name from users");
        assert_eq!(plan.query.to_string(), "select name from users group by name");
        let Merge::Aggregate(aggregate) = plan.merge else {
            panic!("expected aggregate merge");
        };
        assert!(!aggregate.finalize.distinct);
    }

    #[test]
    fn avg_and_count_distinct_are_rejected_across_shards() {
        for sql in ["select avg(id) from users", "select count(distinct name) from users"] {
            let err = plan_sql(sql).expect_err(sql);
            assert!(matches!(err, GateError::Unsupported(_)), "{sql}: {err}");
        }
        // A single shard computes them natively.
        assert!(plan_sql("select avg(id) from users where id = 1").is_ok());
    }

    #[test]
    fn join_pushes_qualified_conjuncts_and_derives_driver() {
        let Plan::Join(join) = plan_sql(
            "select u.id, o.total from users as u join orders as o on o.user_id = u.id \
             where u.name = 'x' and o.total > 10",
        )
        .expect("plan") else {
            panic!("expected join");
        };
        assert_eq!(join.tables.len(), 2);
        assert_eq!(join.tables[0].local.as_ref().map(ToString::to_string).as_deref(), Some("u.name = 'x'"));
        let driver = join.tables[1].driver.as_ref().expect("driver");
        assert_eq!(driver.column, "user_id");
        assert_eq!(driver.outer, Expr::qualified_column("u", "id"));
        assert_eq!(join.tables[1].local.as_ref().map(ToString::to_string).as_deref(), Some("o.total > 10"));
    }

    #[test]
    fn left_join_keeps_where_above_the_join() {
        let Plan::Join(join) = plan_sql(
            "select u.id from users as u left join orders as o on o.user_id = u.id where o.total is null",
        )
        .expect("plan") else {
            panic!("expected join");
        };
        assert!(join.tables[1].local.is_none());
        assert!(join.tables[1].driver.is_some());
    }

    #[test]
    fn subqueries_are_planned_first() {
        let Plan::Subquery(plan) =
            plan_sql("select id from users where id in (select user_id from orders where total > 5)")
                .expect("plan")
        else {
            panic!("expected subquery plan");
        };
        assert_eq!(plan.inner.len(), 1);
        assert!(plan_sql("select id, (select 1) from users").is_err());
    }

    #[test]
    fn vindex_function_shapes() {
        let Plan::VindexFunc(plan) = plan_sql("select * from hash_index where id in (1, 2)").expect("plan") else {
            panic!("expected vindex func");
        };
        assert_eq!(plan.values.len(), 2);
        assert_eq!(plan.columns.len(), 2);
        let err = plan_sql("select id from hash_index where id > 1").expect_err("shape");
        assert!(err.to_string().contains("must be of the form"));
    }
}

//! Router-side joins and uncorrelated subqueries.

use tracing::debug;

use super::{Access, Ctx, Executor};
use crate::error::{GateError, GateResult};
use crate::planner::{plan_select, JoinPlan, SubqueryPlan};
use crate::session::Session;
use crate::sql::ast::{Expr, JoinKind, Select, SelectItem};
use crate::sql::eval::{eval, eval_predicate, Scope, ScopedRow};
use crate::sql::query::evaluate_select;
use crate::value::{BindVars, FieldType, QueryResult, Row, Value};

impl Executor {
    /// Nested-loop join. Each table is read with its local predicates, and
    /// a join driver narrows the inner read to the outer rows' values.
    pub(super) async fn execute_join(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        plan: &JoinPlan,
        binds: &BindVars,
    ) -> GateResult<QueryResult> {
        let mut scope = Scope::default();
        let mut types: Vec<FieldType> = Vec::new();
        let mut rows: Vec<Row> = vec![Vec::new()];

        for table in &plan.tables {
            let mut select = Select::simple(vec![SelectItem::Wildcard(None)], table.table.clone());
            select.from[0].alias = Some(table.reference.clone());
            select.selection = table.local.clone();
            if let Some(driver) = &table.driver {
                let mut values: Vec<Expr> = Vec::new();
                for row in &rows {
                    let value = eval(&driver.outer, &ScopedRow { scope: &scope, row }, binds)?;
                    let literal = Expr::Literal(value);
                    if !matches!(literal, Expr::Literal(Value::Null)) && !values.contains(&literal) {
                        values.push(literal);
                    }
                }
                let filter = if values.is_empty() {
                    Expr::always_false()
                } else {
                    Expr::in_list(
                        Expr::qualified_column(table.reference.clone(), driver.column.clone()),
                        values,
                    )
                };
                select.selection = Some(Expr::and_opt(select.selection.take(), filter));
            }

            let inner_plan = plan_select(&select, &ctx.vschema, None)?;
            let inner = self
                .execute_plan(session, ctx, &inner_plan, binds, Access::Default)
                .await?;
            debug!(table = %table.table, reference = %table.reference, rows = inner.rows.len(), "join leg");

            let table_scope = Scope::for_table(
                &table.reference,
                inner.fields.iter().map(|f| f.name.clone()),
            );
            let joined_scope = scope.join(&table_scope);
            let mut joined = Vec::new();
            for left in &rows {
                let mut matched = false;
                for right in &inner.rows {
                    let mut combined = left.clone();
                    combined.extend(right.iter().cloned());
                    let keep = match &table.on {
                        Some(on) => eval_predicate(
                            on,
                            &ScopedRow {
                                scope: &joined_scope,
                                row: &combined,
                            },
                            binds,
                        )?,
                        None => true,
                    };
                    if keep {
                        matched = true;
                        joined.push(combined);
                    }
                }
                if !matched && table.kind == JoinKind::Left {
                    let mut combined = left.clone();
                    combined.extend(std::iter::repeat(Value::Null).take(table_scope.len()));
                    joined.push(combined);
                }
                if joined.len() > self.config.max_join_rows {
                    return Err(GateError::unsupported(format!(
                        "join produced more than {} rows",
                        self.config.max_join_rows
                    )));
                }
            }
            rows = joined;
            scope = joined_scope;
            types.extend(inner.fields.iter().map(|f| f.field_type));
        }

        Ok(evaluate_select(&plan.select, &scope, &types, rows, binds)?)
    }

    /// Runs each subquery, splices its values into the statement as a
    /// literal list, then plans and runs the rewritten statement.
    pub(super) async fn execute_subquery(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        plan: &SubqueryPlan,
        binds: &BindVars,
        access: Access,
    ) -> GateResult<QueryResult> {
        let mut lists = Vec::with_capacity(plan.inner.len());
        for inner in &plan.inner {
            let result = self.execute_plan(session, ctx, inner, binds, access).await?;
            let mut values: Vec<Expr> = Vec::with_capacity(result.rows.len());
            for row in result.rows {
                let literal = Expr::Literal(row.into_iter().next().unwrap_or(Value::Null));
                if !values.contains(&literal) {
                    values.push(literal);
                }
            }
            lists.push(values);
        }

        let mut select = (*plan.select).clone();
        if let Some(selection) = select.selection.as_mut() {
            let mut lists = lists.into_iter();
            selection.substitute(&mut |expr| match expr {
                Expr::InSubquery { expr, negated, .. } => {
                    let list = lists.next().unwrap_or_default();
                    Some(if list.is_empty() {
                        // Decision: NOT IN over an empty result holds for every row.
                        if *negated {
                            Expr::eq(Expr::literal(1i64), Expr::literal(1i64))
                        } else {
                            Expr::always_false()
                        }
                    } else {
                        Expr::InList {
                            expr: expr.clone(),
                            list,
                            negated: *negated,
                        }
                    })
                }
                _ => None,
            });
        }
        let rewritten = plan_select(&select, &ctx.vschema, plan.target.as_deref())?;
        self.execute_plan(session, ctx, &rewritten, binds, access).await
    }
}

//! INSERT, UPDATE and DELETE planning. Value resolution and lookup
//! maintenance happen in the executor; this module validates the statement
//! against the schema and fixes its route.

use super::route::route_for;
use super::{shard_table_name, DeletePlan, InsertPlan, Plan, UpdatePlan};
use crate::error::{GateError, GateResult};
use crate::sql::ast::{Delete, Insert, Update};
use crate::vschema::VSchema;

pub(super) fn plan_insert(insert: &Insert, vschema: &VSchema, target: Option<&str>) -> GateResult<Plan> {
    let table = vschema.resolve_table(&insert.table, target)?;
    let keyspace = vschema.keyspace(&table.keyspace)?;

    if keyspace.sharded && insert.columns.is_empty() {
        return Err(GateError::unsupported(format!(
            "insert into sharded table {} without a column list",
            table.name
        )));
    }
    if !insert.columns.is_empty() {
        for (idx, row) in insert.rows.iter().enumerate() {
            if row.len() != insert.columns.len() {
                return Err(GateError::Syntax(format!(
                    "column count doesn't match value count at row {}",
                    idx + 1
                )));
            }
        }
    }
    if keyspace.sharded {
        for assignment in &insert.on_duplicate {
            let vindex_column = table.column_vindexes.iter().any(|binding| {
                binding
                    .columns
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(&assignment.column))
            });
            if vindex_column {
                return Err(GateError::unsupported(format!(
                    "DML cannot change vindex column {}",
                    assignment.column
                )));
            }
        }
    }

    let mut insert = insert.clone();
    insert.table = shard_table_name(&insert.table);
    Ok(Plan::Insert(InsertPlan {
        table,
        keyspace,
        insert,
    }))
}

pub(super) fn plan_update(update: &Update, vschema: &VSchema, target: Option<&str>) -> GateResult<Plan> {
    let table = vschema.resolve_table(&update.table, target)?;
    let keyspace = vschema.keyspace(&table.keyspace)?;

    let assigned = |column: &str| {
        update
            .assignments
            .iter()
            .any(|a| a.column.eq_ignore_ascii_case(column))
    };
    if let Some(primary) = table.primary() {
        if primary.columns.iter().any(|c| assigned(c)) {
            return Err(GateError::unsupported("you can't update primary vindex columns"));
        }
    }
    let changed_owned = table
        .owned_vindexes()
        .filter(|binding| binding.columns.iter().any(|c| assigned(c)))
        .cloned()
        .collect();

    let mut update = update.clone();
    update.table = shard_table_name(&update.table);
    let route = route_for(&table, keyspace, &table.name, update.selection.as_mut());
    Ok(Plan::Update(UpdatePlan {
        route,
        table,
        update,
        changed_owned,
    }))
}

pub(super) fn plan_delete(delete: &Delete, vschema: &VSchema, target: Option<&str>) -> GateResult<Plan> {
    let table = vschema.resolve_table(&delete.table, target)?;
    let keyspace = vschema.keyspace(&table.keyspace)?;

    let mut delete = delete.clone();
    delete.table = shard_table_name(&delete.table);
    let route = route_for(&table, keyspace, &table.name, delete.selection.as_mut());
    if delete.limit.is_some() && !route.is_single_shard() {
        return Err(GateError::unsupported("multi-shard delete with limit"));
    }
    let owned = table.owned_vindexes().cloned().collect();
    Ok(Plan::Delete(DeletePlan {
        route,
        table,
        delete,
        owned,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tests::plan_sql;
    use crate::planner::RouteOpcode;

    #[test]
    fn insert_validation() {
        let err = plan_sql("insert into users values (1, 'a')").expect_err("no column list");
        assert!(matches!(err, GateError::Unsupported(_)));
        let err = plan_sql("insert into users (id, name) values (1)").expect_err("arity");
        assert!(err.to_string().contains("column count"));
        let err = plan_sql("insert into users (id, name) values (1, 'a') on duplicate key update name = 'b'")
            .expect_err("vindex column");
        assert!(err.to_string().contains("vindex column name"));
        assert!(plan_sql("insert into users (id, age) values (1, 2) on duplicate key update age = 3").is_ok());
        // Unsharded tables pass through without a column list.
        assert!(plan_sql("insert into name_map values ('a', 1)").is_ok());
    }

    #[test]
    fn update_rejects_primary_vindex_and_tracks_owned_columns() {
        let err = plan_sql("update users set id = 2 where id = 1").expect_err("primary");
        assert_eq!(err.to_string(), "unsupported: you can't update primary vindex columns");

        let Plan::Update(plan) = plan_sql("update users set name = 'b' where id = 1").expect("plan") else {
            panic!("expected update plan");
        };
        assert_eq!(plan.route.opcode, RouteOpcode::EqualUnique);
        assert_eq!(plan.changed_owned.len(), 1);
        assert_eq!(plan.changed_owned[0].vindex.name, "name_map");

        let Plan::Update(plan) = plan_sql("update users set age = 3").expect("plan") else {
            panic!("expected update plan");
        };
        assert_eq!(plan.route.opcode, RouteOpcode::Scatter);
        assert!(plan.changed_owned.is_empty());
    }

    #[test]
    fn delete_with_limit_needs_one_shard() {
        assert!(plan_sql("delete from users where id = 1 limit 1").is_ok());
        let err = plan_sql("delete from users limit 1").expect_err("scatter limit");
        assert!(matches!(err, GateError::Unsupported(_)));
        let Plan::Delete(plan) = plan_sql("delete from users where name = 'x'").expect("plan") else {
            panic!("expected delete plan");
        };
        assert_eq!(plan.owned.len(), 1);
        assert_eq!(plan.route.opcode, RouteOpcode::Equal);
    }
}

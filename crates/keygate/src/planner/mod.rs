//! Statement planning.
//!
//! `plan` is a pure function of a parsed statement and a schema snapshot.
//! It decides how a statement is routed and merged but never resolves
//! lookup vindexes or touches a shard; that happens in the executor.

mod dml;
pub mod route;
mod select;

use std::sync::Arc;

use crate::error::{GateError, GateResult};
use crate::sql::ast::{Delete, Expr, Insert, JoinKind, Select, Statement, TableName, Update};
use crate::sql::aggregate::AggregateKind;
use crate::topology::TabletRole;
use crate::vindex::Vindex;
use crate::vschema::{ColumnVindex, Keyspace, Table, TableKind, VSchema};

pub use route::{Route, RouteOpcode, RouteValues, ROUTE_LIST_ARG};
pub(crate) use select::{plan_select, slot_name};

#[derive(Clone, Debug)]
pub enum Plan {
    Select(SelectPlan),
    /// Table-less SELECT, answered by one shard of `keyspace`.
    Dual {
        keyspace: Arc<Keyspace>,
        query: Box<Select>,
    },
    Join(JoinPlan),
    Subquery(SubqueryPlan),
    VindexFunc(VindexFuncPlan),
    NextValues {
        /// Keyspace-qualified sequence table.
        sequence: TableName,
        count: Expr,
    },
    Insert(InsertPlan),
    Update(UpdatePlan),
    Delete(DeletePlan),
    Truncate {
        keyspace: Arc<Keyspace>,
        table: String,
    },
    Begin,
    Commit,
    Rollback,
    Use {
        keyspace: Option<String>,
        role: Option<TabletRole>,
    },
}

/// Label used in logs and per-plan metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanKind {
    SingleShard,
    MultiValue,
    Scatter,
    ScatterOrdered,
    ScatterAggregate,
    Join,
    Subquery,
    VindexFunc,
    Sequence,
    Insert,
    Update,
    Delete,
    Truncate,
    Session,
    Dual,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::SingleShard => "single_shard",
            PlanKind::MultiValue => "multi_value",
            PlanKind::Scatter => "scatter",
            PlanKind::ScatterOrdered => "scatter_ordered",
            PlanKind::ScatterAggregate => "scatter_aggregate",
            PlanKind::Join => "join",
            PlanKind::Subquery => "subquery",
            PlanKind::VindexFunc => "vindex_func",
            PlanKind::Sequence => "sequence",
            PlanKind::Insert => "insert",
            PlanKind::Update => "update",
            PlanKind::Delete => "delete",
            PlanKind::Truncate => "truncate",
            PlanKind::Session => "session",
            PlanKind::Dual => "dual",
        }
    }
}

impl Plan {
    pub fn kind(&self) -> PlanKind {
        match self {
            Plan::Select(plan) => match (&plan.merge, plan.route.opcode) {
                (Merge::Aggregate(_), _) => PlanKind::ScatterAggregate,
                (Merge::Ordered { .. }, _) => PlanKind::ScatterOrdered,
                (_, RouteOpcode::Unsharded | RouteOpcode::EqualUnique) => PlanKind::SingleShard,
                (_, RouteOpcode::Equal | RouteOpcode::In) => PlanKind::MultiValue,
                (_, RouteOpcode::Scatter) => PlanKind::Scatter,
            },
            Plan::Dual { .. } => PlanKind::Dual,
            Plan::Join(_) => PlanKind::Join,
            Plan::Subquery(_) => PlanKind::Subquery,
            Plan::VindexFunc(_) => PlanKind::VindexFunc,
            Plan::NextValues { .. } => PlanKind::Sequence,
            Plan::Insert(_) => PlanKind::Insert,
            Plan::Update(_) => PlanKind::Update,
            Plan::Delete(_) => PlanKind::Delete,
            Plan::Truncate { .. } => PlanKind::Truncate,
            Plan::Begin | Plan::Commit | Plan::Rollback | Plan::Use { .. } => PlanKind::Session,
        }
    }

    /// True for plans that write to shards.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Plan::Insert(_) | Plan::Update(_) | Plan::Delete(_) | Plan::Truncate { .. }
        )
    }
}

/// Single-table SELECT routed to one or more shards.
#[derive(Clone, Debug)]
pub struct SelectPlan {
    pub route: Route,
    pub table: Arc<Table>,
    /// Statement sent to each shard, keyspace qualifier stripped. An
    /// IN-routed value list appears as the `ROUTE_LIST_ARG` placeholder.
    pub query: Select,
    pub merge: Merge,
    /// Trailing columns added for merging and trimmed from the result.
    pub hidden: usize,
}

/// How per-shard results combine.
#[derive(Clone, Debug)]
pub enum Merge {
    /// One shard answers; its result is returned unchanged.
    Pass,
    /// Rows are concatenated in arrival order.
    Concat,
    /// k-way merge on the ORDER BY keys, then the window is applied.
    Ordered {
        keys: Vec<(KeyCol, bool)>,
        limit: Option<Expr>,
        offset: Option<Expr>,
    },
    Aggregate(AggregatePlan),
}

/// Where an ORDER BY key sits in a shard row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyCol {
    /// Projected column position.
    At(usize),
    /// Position among the hidden trailing columns.
    Hidden(usize),
}

/// Second aggregation pass over shard partials.
#[derive(Clone, Debug)]
pub struct AggregatePlan {
    /// Leading shard columns forming the group key.
    pub group_slots: usize,
    /// How each column after the group key merges.
    pub kinds: Vec<SlotMerge>,
    /// Evaluated over merged rows whose columns are named `#0`, `#1`, ...
    pub finalize: Select,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotMerge {
    Aggregate(AggregateKind),
    /// Bare column outside the group key; any value of the group will do.
    Any,
}

#[derive(Clone, Debug)]
pub struct JoinPlan {
    pub select: Box<Select>,
    pub tables: Vec<JoinTable>,
}

#[derive(Clone, Debug)]
pub struct JoinTable {
    /// Keyspace-qualified table name.
    pub table: TableName,
    pub reference: String,
    pub kind: JoinKind,
    pub on: Option<Expr>,
    /// Conjuncts that only reference this table.
    pub local: Option<Expr>,
    pub driver: Option<JoinDriver>,
}

/// `reference.column = <expr over earlier tables>`: the outer values feed a
/// derived IN list on the inner table.
#[derive(Clone, Debug)]
pub struct JoinDriver {
    pub column: String,
    pub outer: Expr,
}

/// SELECT with uncorrelated `IN (SELECT ...)` predicates. The inner plans run
/// first, then the rewritten statement is planned and executed.
#[derive(Clone, Debug)]
pub struct SubqueryPlan {
    pub select: Box<Select>,
    pub inner: Vec<Plan>,
    pub target: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VindexColumn {
    Id,
    KeyspaceId,
}

#[derive(Clone, Debug)]
pub struct VindexFuncPlan {
    pub vindex: Arc<Vindex>,
    pub values: Vec<Expr>,
    pub columns: Vec<(String, VindexColumn)>,
}

#[derive(Clone, Debug)]
pub struct InsertPlan {
    pub table: Arc<Table>,
    pub keyspace: Arc<Keyspace>,
    /// Keyspace qualifier stripped.
    pub insert: Insert,
}

#[derive(Clone, Debug)]
pub struct UpdatePlan {
    pub route: Route,
    pub table: Arc<Table>,
    pub update: Update,
    /// Owned vindexes whose columns are assigned.
    pub changed_owned: Vec<ColumnVindex>,
}

#[derive(Clone, Debug)]
pub struct DeletePlan {
    pub route: Route,
    pub table: Arc<Table>,
    pub delete: Delete,
    pub owned: Vec<ColumnVindex>,
}

/// Plans `statement` against `vschema`; `target` is the session's default
/// keyspace.
pub fn plan(statement: &Statement, vschema: &VSchema, target: Option<&str>) -> GateResult<Plan> {
    match statement {
        Statement::Select(select) => plan_select(select, vschema, target),
        Statement::Insert(insert) => dml::plan_insert(insert, vschema, target),
        Statement::Update(update) => dml::plan_update(update, vschema, target),
        Statement::Delete(delete) => dml::plan_delete(delete, vschema, target),
        Statement::Truncate(name) => {
            let table = vschema.resolve_table(name, target)?;
            Ok(Plan::Truncate {
                keyspace: vschema.keyspace(&table.keyspace)?,
                table: table.name.clone(),
            })
        }
        Statement::NextValues { count, sequence } => {
            let table = vschema.resolve_table(sequence, target)?;
            if table.kind != TableKind::Sequence {
                return Err(GateError::schema(format!(
                    "table {} is not a sequence",
                    table.name
                )));
            }
            Ok(Plan::NextValues {
                sequence: table.qualified_name(),
                count: count.clone(),
            })
        }
        Statement::Begin => Ok(Plan::Begin),
        Statement::Commit => Ok(Plan::Commit),
        Statement::Rollback => Ok(Plan::Rollback),
        Statement::Use { keyspace, role } => {
            let keyspace = match keyspace {
                Some(name) => Some(vschema.keyspace(name)?.name.clone()),
                None => None,
            };
            let role = role.as_deref().map(str::parse).transpose()?;
            Ok(Plan::Use { keyspace, role })
        }
    }
}

/// Copy of `name` without its keyspace qualifier, as shards see it.
pub(crate) fn shard_table_name(name: &TableName) -> TableName {
    TableName::new(name.name.clone())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sql::parse::parse_statement;
    use crate::vschema::VSchemaSource;

    pub(crate) fn test_vschema() -> VSchema {
        let source = VSchemaSource::from_json(
            r#"{
              "keyspaces": {
                "user": {
                  "sharded": true,
                  "vindexes": {
                    "hash_index": {"type": "hash"},
                    "name_map": {"type": "lookup_hash",
                                 "params": {"table": "lookup.name_map", "from": "name", "to": "user_id"},
                                 "owner": "users"},
                    "email_map": {"type": "lookup_hash_unique",
                                  "params": {"table": "lookup.email_map", "from": "email", "to": "user_id"}}
                  },
                  "tables": {
                    "users": {
                      "column_vindexes": [
                        {"column": "id", "name": "hash_index"},
                        {"column": "name", "name": "name_map"},
                        {"column": "email", "name": "email_map"}
                      ],
                      "auto_increment": {"column": "id", "sequence": "users_seq"}
                    },
                    "orders": {
                      "column_vindexes": [{"column": "user_id", "name": "hash_index"}]
                    }
                  }
                },
                "lookup": {
                  "sharded": false,
                  "tables": {
                    "name_map": {},
                    "email_map": {},
                    "users_seq": {"type": "sequence"}
                  }
                }
              }
            }"#,
        )
        .expect("vschema json");
        VSchema::build(Arc::new(source), &|ks: &str| match ks {
            "user" => vec!["-80".to_string(), "80-".to_string()],
            _ => vec!["0".to_string()],
        })
        .expect("vschema")
    }

    pub(crate) fn plan_sql(sql: &str) -> GateResult<Plan> {
        let statement = parse_statement(sql)?;
        plan(&statement, &test_vschema(), None)
    }

    #[test]
    fn classifies_select_routes() {
        let cases = [
            ("select * from users where id = 1", PlanKind::SingleShard),
            ("select * from users where id in (1, 2)", PlanKind::MultiValue),
            ("select * from users where name = 'x'", PlanKind::MultiValue),
            ("select * from users where email = 'a@b'", PlanKind::SingleShard),
            ("select * from users", PlanKind::Scatter),
            ("select id from users order by id limit 2", PlanKind::ScatterOrdered),
            ("select count(*) from users", PlanKind::ScatterAggregate),
            ("select * from name_map where name = 'x'", PlanKind::SingleShard),
            ("select 1 + 1", PlanKind::Dual),
            ("select next 2 values from users_seq", PlanKind::Sequence),
            ("select id, keyspace_id from hash_index where id = 1", PlanKind::VindexFunc),
        ];
        for (sql, kind) in cases {
            let plan = plan_sql(sql).unwrap_or_else(|err| panic!("{sql}: {err}"));
            assert_eq!(plan.kind(), kind, "{sql}");
        }
    }

    #[test]
    fn hash_beats_lookup_when_both_apply() {
        let Plan::Select(plan) = plan_sql("select * from users where name = 'x' and id = 5").expect("plan")
        else {
            panic!("expected select plan");
        };
        assert_eq!(plan.route.opcode, RouteOpcode::EqualUnique);
        assert_eq!(plan.route.vindex.as_ref().map(|v| v.name.as_str()), Some("hash_index"));
    }

    #[test]
    fn in_list_becomes_route_placeholder() {
        let Plan::Select(plan) = plan_sql("select * from user.users where id in (1, 2, 3)").expect("plan")
        else {
            panic!("expected select plan");
        };
        assert_eq!(plan.route.values, RouteValues::In(vec![
            Expr::literal(1i64),
            Expr::literal(2i64),
            Expr::literal(3i64),
        ]));
        assert_eq!(
            plan.query.to_string(),
            "select * from users where id in (::__route_values)"
        );
    }

    #[test]
    fn session_statements_validate_keyspace() {
        assert!(matches!(plan_sql("use user").expect("plan"), Plan::Use { .. }));
        let err = plan_sql("use nosuch").expect_err("unknown keyspace");
        assert_eq!(err.to_string(), "keyspace nosuch not found in vschema");
        let err = plan_sql("select next 1 values from users").expect_err("not a sequence");
        assert!(err.to_string().contains("not a sequence"));
    }
}

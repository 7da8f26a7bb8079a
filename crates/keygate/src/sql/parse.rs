//! Adapter from the `sqlparser` tree to the router's statement tree.
//!
//! Session statements (`BEGIN`, `USE`, ...) and the sequence read form are
//! recognized textually before the grammar runs; everything else goes through
//! the MySQL dialect and is converted node by node. Constructs the router
//! cannot plan are rejected here as unsupported.

use std::time::Duration;

use sqlparser::ast::{
    Assignment as SqlAssignment, AssignmentTarget, BinaryOperator, Distinct, DuplicateTreatment,
    Expr as SqlExpr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr,
    JoinConstraint, JoinOperator, LimitClause, LockType, ObjectName, ObjectNamePart, OnInsert,
    OrderByExpr, OrderByKind, Query, Select as SqlSelect, SelectItem as SqlSelectItem,
    SelectItemQualifiedWildcardKind, SetExpr, Statement as SqlStatement, TableFactor,
    TableObject, TableWithJoins, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use super::ast::{
    Assignment, BinaryOp, Delete, Expr, Insert, JoinKind, LockMode, OrderBy, Select,
    SelectItem, Statement, TableName, TableRef, UnaryOp, Update,
};
use crate::error::{GateError, GateResult};
use crate::value::Value;

/// Per-statement options carried in a `/*gate+ ... */` comment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directives {
    pub query_timeout: Option<Duration>,
    pub scatter_errors_as_warnings: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedStatement {
    pub statement: Statement,
    pub directives: Directives,
}

pub const DIRECTIVE_PREFIX: &str = "/*gate+";

/// Parses one statement together with its directives.
pub fn parse(sql: &str) -> GateResult<ParsedStatement> {
    let directives = parse_directives(sql);
    let statement = parse_statement(sql)?;
    Ok(ParsedStatement {
        statement,
        directives,
    })
}

/// Parses one statement, ignoring directives.
pub fn parse_statement(sql: &str) -> GateResult<Statement> {
    let stripped = strip_comments(sql);
    let trimmed = stripped.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(GateError::Syntax("empty statement".to_string()));
    }
    if let Some(statement) = parse_textual(trimmed)? {
        return Ok(statement);
    }

    let mut statements = Parser::parse_sql(&MySqlDialect {}, sql)
        .map_err(|err| GateError::Syntax(format!("{err} near '{}'", abbreviate(trimmed))))?;
    if statements.len() != 1 {
        return Err(GateError::Syntax(format!(
            "expected exactly one statement, found {}",
            statements.len()
        )));
    }
    let statement = statements.remove(0);
    Converter::default().statement(&statement)
}

/// Extracts directives from every `/*gate+ ... */` comment.
pub fn parse_directives(sql: &str) -> Directives {
    let mut directives = Directives::default();
    let mut rest = sql;
    while let Some(start) = rest.find(DIRECTIVE_PREFIX) {
        let body_start = start + DIRECTIVE_PREFIX.len();
        let Some(len) = rest[body_start..].find("*/") else {
            break;
        };
        for token in rest[body_start..body_start + len].split_whitespace() {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));
            match key.to_ascii_uppercase().as_str() {
                "QUERY_TIMEOUT_MS" => {
                    if let Ok(ms) = value.parse::<u64>() {
                        directives.query_timeout = Some(Duration::from_millis(ms));
                    }
                }
                "SCATTER_ERRORS_AS_WARNINGS" => directives.scatter_errors_as_warnings = true,
                _ => {}
            }
        }
        rest = &rest[body_start + len + 2..];
    }
    directives
}

/// Removes comments outside quoted text.
fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut idx = 0;
    while idx < chars.len() {
        let c = chars[idx];
        match c {
            '\'' | '"' | '`' => {
                out.push(c);
                idx += 1;
                while idx < chars.len() {
                    out.push(chars[idx]);
                    if chars[idx] == '\\' && c != '`' && idx + 1 < chars.len() {
                        out.push(chars[idx + 1]);
                        idx += 2;
                        continue;
                    }
                    idx += 1;
                    if chars[idx - 1] == c {
                        break;
                    }
                }
            }
            '/' if chars.get(idx + 1) == Some(&'*') => {
                idx += 2;
                while idx < chars.len() && !(chars[idx] == '*' && chars.get(idx + 1) == Some(&'/')) {
                    idx += 1;
                }
                idx += 2;
                out.push(' ');
            }
            '-' if chars.get(idx + 1) == Some(&'-') => {
                while idx < chars.len() && chars[idx] != '\n' {
                    idx += 1;
                }
            }
            '#' => {
                while idx < chars.len() && chars[idx] != '\n' {
                    idx += 1;
                }
            }
            other => {
                out.push(other);
                idx += 1;
            }
        }
    }
    out
}

fn abbreviate(sql: &str) -> String {
    const MAX: usize = 64;
    if sql.chars().count() <= MAX {
        sql.to_string()
    } else {
        format!("{}...", sql.chars().take(MAX).collect::<String>())
    }
}

fn unquote_ident(raw: &str) -> String {
    raw.trim().replace('`', "")
}

/// Statements the grammar either lacks or parses in a dialect-specific way.
fn parse_textual(sql: &str) -> GateResult<Option<Statement>> {
    let words: Vec<&str> = sql.split_whitespace().collect();
    let lower: Vec<String> = words.iter().map(|w| w.to_ascii_lowercase()).collect();
    let lower: Vec<&str> = lower.iter().map(String::as_str).collect();

    let statement = match lower.as_slice() {
        ["begin"] | ["begin", "work"] | ["start", "transaction"] => Statement::Begin,
        ["commit"] | ["commit", "work"] => Statement::Commit,
        ["rollback"] | ["rollback", "work"] => Statement::Rollback,
        ["use"] => Statement::Use {
            keyspace: None,
            role: None,
        },
        ["use", _] => {
            let target = unquote_ident(words[1]);
            let (keyspace, role) = match target.split_once('@') {
                Some((keyspace, role)) => (keyspace.to_string(), Some(role.to_ascii_lowercase())),
                None => (target, None),
            };
            Statement::Use {
                keyspace: if keyspace.is_empty() {
                    None
                } else {
                    Some(keyspace)
                },
                role,
            }
        }
        ["truncate", "table", _] | ["truncate", _] => {
            let name = words[words.len() - 1];
            Statement::Truncate(table_name_from_text(name))
        }
        ["select", "next", "value", "from", _] => Statement::NextValues {
            count: Expr::Literal(Value::Int(1)),
            sequence: table_name_from_text(words[4]),
        },
        ["select", "next", count, "values", "from", _] => {
            let count = if let Some(name) = count.strip_prefix(':') {
                Expr::BindVar(name.to_string())
            } else {
                let parsed = count.parse::<i64>().map_err(|_| {
                    GateError::Syntax(format!("invalid sequence count '{}'", words[2]))
                })?;
                Expr::Literal(Value::Int(parsed))
            };
            Statement::NextValues {
                count,
                sequence: table_name_from_text(words[5]),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(statement))
}

fn table_name_from_text(raw: &str) -> TableName {
    match raw.split_once('.') {
        Some((qualifier, name)) => TableName::qualified(unquote_ident(qualifier), unquote_ident(name)),
        None => TableName::new(unquote_ident(raw)),
    }
}

/// Tree conversion state; numbers positional `?` placeholders in text
/// order as `v1`, `v2`, ...
#[derive(Default)]
struct Converter {
    positional: usize,
}

impl Converter {
    fn statement(&mut self, statement: &SqlStatement) -> GateResult<Statement> {
        match statement {
            SqlStatement::Query(query) => Ok(Statement::Select(Box::new(self.query(query)?))),
            SqlStatement::Insert(insert) => {
                if insert.replace_into {
                    return Err(GateError::unsupported("REPLACE"));
                }
                let TableObject::TableName(name) = &insert.table else {
                    return Err(GateError::unsupported("INSERT into a table function"));
                };
                let table = self.table_name(name)?;
                let columns = insert.columns.iter().map(|c| c.value.clone()).collect();
                let Some(source) = &insert.source else {
                    return Err(GateError::unsupported("INSERT without VALUES"));
                };
                let SetExpr::Values(values) = source.body.as_ref() else {
                    return Err(GateError::unsupported("INSERT ... SELECT"));
                };
                let mut rows = Vec::with_capacity(values.rows.len());
                for row in &values.rows {
                    rows.push(self.exprs(row)?);
                }
                let on_duplicate = match &insert.on {
                    None => Vec::new(),
                    Some(OnInsert::DuplicateKeyUpdate(assignments)) => self.assignments(assignments)?,
                    Some(_) => return Err(GateError::unsupported("ON CONFLICT")),
                };
                Ok(Statement::Insert(Insert {
                    table,
                    columns,
                    rows,
                    ignore: insert.ignore,
                    on_duplicate,
                }))
            }
            SqlStatement::Update {
                table,
                assignments,
                from,
                selection,
                ..
            } => {
                if from.is_some() {
                    return Err(GateError::unsupported("UPDATE ... FROM"));
                }
                let table = self.single_table(table)?;
                let assignments = self.assignments(assignments)?;
                let selection = selection.as_ref().map(|e| self.expr(e)).transpose()?;
                Ok(Statement::Update(Update {
                    table,
                    assignments,
                    selection,
                }))
            }
            SqlStatement::Delete(delete) => {
                if !delete.tables.is_empty() || delete.using.is_some() {
                    return Err(GateError::unsupported("multi-table DELETE"));
                }
                let tables = match &delete.from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
                };
                let [table] = tables.as_slice() else {
                    return Err(GateError::unsupported("multi-table DELETE"));
                };
                let table = self.single_table(table)?;
                let selection = delete.selection.as_ref().map(|e| self.expr(e)).transpose()?;
                let order_by = self.order_by(&delete.order_by)?;
                let limit = delete.limit.as_ref().map(|e| self.expr(e)).transpose()?;
                Ok(Statement::Delete(Delete {
                    table,
                    selection,
                    order_by,
                    limit,
                }))
            }
            SqlStatement::StartTransaction { .. } => Ok(Statement::Begin),
            SqlStatement::Commit { .. } => Ok(Statement::Commit),
            SqlStatement::Rollback { .. } => Ok(Statement::Rollback),
            other => Err(GateError::unsupported(format!(
                "statement: {}",
                abbreviate(&other.to_string())
            ))),
        }
    }

    fn query(&mut self, query: &Query) -> GateResult<Select> {
        if query.with.is_some() {
            return Err(GateError::unsupported("WITH"));
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(GateError::unsupported("set operations"));
        };
        let mut out = self.select(select)?;
        if let Some(order_by) = &query.order_by {
            let OrderByKind::Expressions(exprs) = &order_by.kind else {
                return Err(GateError::unsupported("ORDER BY ALL"));
            };
            out.order_by = self.order_by(exprs)?;
        }
        match &query.limit_clause {
            None => {}
            Some(LimitClause::LimitOffset { limit, offset, .. }) => {
                out.limit = limit.as_ref().map(|e| self.expr(e)).transpose()?;
                out.offset = offset.as_ref().map(|o| self.expr(&o.value)).transpose()?;
            }
            Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
                out.offset = Some(self.expr(offset)?);
                out.limit = Some(self.expr(limit)?);
            }
        }
        for lock in &query.locks {
            out.lock = Some(match lock.lock_type {
                LockType::Update => LockMode::Update,
                LockType::Share => LockMode::Share,
            });
        }
        Ok(out)
    }

    fn select(&mut self, select: &SqlSelect) -> GateResult<Select> {
        let distinct = match &select.distinct {
            None => false,
            Some(Distinct::Distinct) => true,
            Some(_) => return Err(GateError::unsupported("DISTINCT ON")),
        };
        let mut projection = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            projection.push(self.select_item(item)?);
        }
        let mut from = Vec::new();
        for table in &select.from {
            self.table_with_joins(table, &mut from)?;
        }
        let selection = select.selection.as_ref().map(|e| self.expr(e)).transpose()?;
        let group_by = match &select.group_by {
            GroupByExpr::Expressions(exprs, _) => self.exprs(exprs)?,
            GroupByExpr::All(_) => return Err(GateError::unsupported("GROUP BY ALL")),
        };
        let having = select.having.as_ref().map(|e| self.expr(e)).transpose()?;
        Ok(Select {
            distinct,
            projection,
            from,
            selection,
            group_by,
            having,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            lock: None,
        })
    }

    fn select_item(&mut self, item: &SqlSelectItem) -> GateResult<SelectItem> {
        match item {
            SqlSelectItem::UnnamedExpr(expr) => Ok(SelectItem::Expr {
                expr: self.expr(expr)?,
                alias: None,
            }),
            SqlSelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem::Expr {
                expr: self.expr(expr)?,
                alias: Some(alias.value.clone()),
            }),
            SqlSelectItem::Wildcard(_) => Ok(SelectItem::Wildcard(None)),
            SqlSelectItem::QualifiedWildcard(kind, _) => match kind {
                SelectItemQualifiedWildcardKind::ObjectName(name) => {
                    let table = self.table_name(name)?;
                    Ok(SelectItem::Wildcard(Some(table.name)))
                }
                #[allow(unreachable_patterns)]
                _ => Err(GateError::unsupported("expression wildcard")),
            },
        }
    }

    fn table_with_joins(&mut self, table: &TableWithJoins, out: &mut Vec<TableRef>) -> GateResult<()> {
        out.push(self.table_factor(&table.relation)?);
        for join in &table.joins {
            let mut table_ref = self.table_factor(&join.relation)?;
            let (kind, constraint) = match &join.join_operator {
                JoinOperator::Inner(constraint) => (JoinKind::Inner, constraint),
                JoinOperator::LeftOuter(constraint) => (JoinKind::Left, constraint),
                _ => return Err(GateError::unsupported("join type")),
            };
            table_ref.join = kind;
            table_ref.on = match constraint {
                JoinConstraint::On(expr) => Some(self.expr(expr)?),
                JoinConstraint::None => None,
                _ => return Err(GateError::unsupported("join USING or NATURAL")),
            };
            out.push(table_ref);
        }
        Ok(())
    }

    fn table_factor(&mut self, factor: &TableFactor) -> GateResult<TableRef> {
        let TableFactor::Table { name, alias, .. } = factor else {
            return Err(GateError::unsupported("derived table"));
        };
        let mut table_ref = TableRef::new(self.table_name(name)?);
        table_ref.alias = alias.as_ref().map(|a| a.name.value.clone());
        Ok(table_ref)
    }

    fn single_table(&mut self, table: &TableWithJoins) -> GateResult<TableName> {
        if !table.joins.is_empty() {
            return Err(GateError::unsupported("multi-table DML"));
        }
        Ok(self.table_factor(&table.relation)?.table)
    }

    fn table_name(&self, name: &ObjectName) -> GateResult<TableName> {
        let parts = object_name_parts(name);
        match parts.as_slice() {
            [name] => Ok(TableName::new(name.clone())),
            [qualifier, name] => Ok(TableName::qualified(qualifier.clone(), name.clone())),
            _ => Err(GateError::Syntax(format!("invalid table name: {name}"))),
        }
    }

    fn order_by(&mut self, exprs: &[OrderByExpr]) -> GateResult<Vec<OrderBy>> {
        exprs
            .iter()
            .map(|item| {
                Ok(OrderBy {
                    expr: self.expr(&item.expr)?,
                    desc: item.options.asc == Some(false),
                })
            })
            .collect()
    }

    fn assignments(&mut self, assignments: &[SqlAssignment]) -> GateResult<Vec<Assignment>> {
        let mut out = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let AssignmentTarget::ColumnName(name) = &assignment.target else {
                return Err(GateError::unsupported("tuple assignment"));
            };
            let column = object_name_parts(name)
                .pop()
                .ok_or_else(|| GateError::Syntax("empty assignment target".to_string()))?;
            out.push(Assignment {
                column,
                value: self.expr(&assignment.value)?,
            });
        }
        Ok(out)
    }

    fn exprs(&mut self, exprs: &[SqlExpr]) -> GateResult<Vec<Expr>> {
        exprs.iter().map(|e| self.expr(e)).collect()
    }

    fn expr(&mut self, expr: &SqlExpr) -> GateResult<Expr> {
        Ok(match expr {
            SqlExpr::Identifier(ident) => Expr::column(ident.value.clone()),
            SqlExpr::CompoundIdentifier(idents) => match idents.as_slice() {
                [table, column] => Expr::qualified_column(table.value.clone(), column.value.clone()),
                [_, table, column] => {
                    Expr::qualified_column(table.value.clone(), column.value.clone())
                }
                _ => return Err(GateError::Syntax(format!("invalid column reference: {expr}"))),
            },
            SqlExpr::Value(value) => self.value(&value.value)?,
            SqlExpr::Nested(inner) => self.expr(inner)?,
            SqlExpr::BinaryOp { left, op, right } => {
                let op = match op {
                    BinaryOperator::Or => BinaryOp::Or,
                    BinaryOperator::And => BinaryOp::And,
                    BinaryOperator::Eq => BinaryOp::Eq,
                    BinaryOperator::NotEq => BinaryOp::NotEq,
                    BinaryOperator::Lt => BinaryOp::Lt,
                    BinaryOperator::LtEq => BinaryOp::LtEq,
                    BinaryOperator::Gt => BinaryOp::Gt,
                    BinaryOperator::GtEq => BinaryOp::GtEq,
                    BinaryOperator::Plus => BinaryOp::Plus,
                    BinaryOperator::Minus => BinaryOp::Minus,
                    BinaryOperator::Multiply => BinaryOp::Multiply,
                    BinaryOperator::Divide => BinaryOp::Divide,
                    BinaryOperator::Modulo => BinaryOp::Modulo,
                    other => return Err(GateError::unsupported(format!("operator {other}"))),
                };
                Expr::binary(self.expr(left)?, op, self.expr(right)?)
            }
            SqlExpr::UnaryOp { op, expr: inner } => {
                let inner = self.expr(inner)?;
                match op {
                    UnaryOperator::Not => Expr::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(inner),
                    },
                    UnaryOperator::Plus => inner,
                    UnaryOperator::Minus => match inner {
                        Expr::Literal(Value::Int(v)) => Expr::Literal(Value::Int(v.wrapping_neg())),
                        Expr::Literal(Value::Float(v)) => Expr::Literal(Value::Float(-v)),
                        other => Expr::Unary {
                            op: UnaryOp::Neg,
                            expr: Box::new(other),
                        },
                    },
                    other => return Err(GateError::unsupported(format!("operator {other}"))),
                }
            }
            SqlExpr::IsNull(inner) => Expr::IsNull {
                expr: Box::new(self.expr(inner)?),
                negated: false,
            },
            SqlExpr::IsNotNull(inner) => Expr::IsNull {
                expr: Box::new(self.expr(inner)?),
                negated: true,
            },
            SqlExpr::InList {
                expr: inner,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(self.expr(inner)?),
                list: self.exprs(list)?,
                negated: *negated,
            },
            SqlExpr::InSubquery {
                expr: inner,
                subquery,
                negated,
            } => Expr::InSubquery {
                expr: Box::new(self.expr(inner)?),
                subquery: Box::new(self.query(subquery)?),
                negated: *negated,
            },
            SqlExpr::Between {
                expr: inner,
                negated,
                low,
                high,
            } => Expr::Between {
                expr: Box::new(self.expr(inner)?),
                low: Box::new(self.expr(low)?),
                high: Box::new(self.expr(high)?),
                negated: *negated,
            },
            SqlExpr::Like {
                negated,
                expr: inner,
                pattern,
                ..
            } => Expr::Like {
                expr: Box::new(self.expr(inner)?),
                pattern: Box::new(self.expr(pattern)?),
                negated: *negated,
            },
            SqlExpr::Tuple(items) => Expr::Tuple(self.exprs(items)?),
            SqlExpr::Function(function) => {
                if function.over.is_some() {
                    return Err(GateError::unsupported("window functions"));
                }
                let name = object_name_parts(&function.name)
                    .pop()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                let mut args = Vec::new();
                let mut distinct = false;
                let mut star = false;
                match &function.args {
                    FunctionArguments::None => {}
                    FunctionArguments::List(list) => {
                        distinct = matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct));
                        for arg in &list.args {
                            match arg {
                                FunctionArg::Unnamed(FunctionArgExpr::Expr(arg)) => {
                                    args.push(self.expr(arg)?)
                                }
                                FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => star = true,
                                _ => {
                                    return Err(GateError::unsupported(format!(
                                        "argument form in {name}()"
                                    )))
                                }
                            }
                        }
                    }
                    FunctionArguments::Subquery(_) => {
                        return Err(GateError::unsupported("subquery function argument"))
                    }
                }
                Expr::Function {
                    name,
                    args,
                    distinct,
                    star,
                }
            }
            other => {
                return Err(GateError::unsupported(format!(
                    "expression: {}",
                    abbreviate(&other.to_string())
                )))
            }
        })
    }

    fn value(&mut self, value: &SqlValue) -> GateResult<Expr> {
        Ok(match value {
            SqlValue::Number(raw, _) => {
                if let Ok(v) = raw.parse::<i64>() {
                    Expr::Literal(Value::Int(v))
                } else {
                    let v = raw
                        .parse::<f64>()
                        .map_err(|_| GateError::Syntax(format!("invalid number: {raw}")))?;
                    Expr::Literal(Value::Float(v))
                }
            }
            SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
                Expr::Literal(Value::Text(s.clone()))
            }
            SqlValue::HexStringLiteral(raw) => {
                let bytes = hex::decode(raw)
                    .map_err(|err| GateError::Syntax(format!("invalid hex literal {raw}: {err}")))?;
                Expr::Literal(Value::Bytes(bytes))
            }
            SqlValue::Boolean(v) => Expr::Literal(Value::Int(i64::from(*v))),
            SqlValue::Null => Expr::Literal(Value::Null),
            SqlValue::Placeholder(raw) => {
                if raw == "?" {
                    self.positional += 1;
                    Expr::BindVar(format!("v{}", self.positional))
                } else if let Some(name) = raw.strip_prefix(':') {
                    Expr::BindVar(name.to_string())
                } else {
                    return Err(GateError::unsupported(format!("placeholder {raw}")));
                }
            }
            other => return Err(GateError::unsupported(format!("literal {other}"))),
        })
    }
}

fn object_name_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident.value.clone()),
            #[allow(unreachable_patterns)]
            _ => None,
        })
        .collect()
}

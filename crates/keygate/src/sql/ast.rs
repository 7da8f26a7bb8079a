//! Abstract statement tree the router plans over, and its SQL renderer.
//!
//! The tree covers the subset of MySQL the router understands. Rendering is
//! the inverse of parsing: `Display` produces SQL text that the parser reads
//! back into an equal tree, which is how per-shard statements are shipped.

use std::fmt::{self, Write as _};

use crate::value::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Select(Box<Select>),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Truncate(TableName),
    Begin,
    Commit,
    Rollback,
    /// `USE keyspace[@role]`.
    Use {
        keyspace: Option<String>,
        role: Option<String>,
    },
    /// `SELECT NEXT <count> VALUES FROM <sequence>`.
    NextValues { count: Expr, sequence: TableName },
}

impl Statement {
    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_) | Statement::Truncate(_)
        )
    }
}

/// Possibly keyspace-qualified table name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableName {
    pub qualifier: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }

    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            name: name.into(),
        }
    }

    /// Parses `table` or `keyspace.table`.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('.') {
            Some((qualifier, name)) => Self::qualified(qualifier.trim(), name.trim()),
            None => Self::new(raw.trim()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub projection: Vec<SelectItem>,
    pub from: Vec<TableRef>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
    pub lock: Option<LockMode>,
}

impl Select {
    /// `SELECT <projection> FROM <table>` with nothing else set.
    pub fn simple(projection: Vec<SelectItem>, table: TableName) -> Self {
        Self {
            distinct: false,
            projection,
            from: vec![TableRef::new(table)],
            selection: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            lock: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SelectItem {
    /// `*` or `t.*`.
    Wildcard(Option<String>),
    Expr { expr: Expr, alias: Option<String> },
}

impl SelectItem {
    pub fn column(name: impl Into<String>) -> Self {
        SelectItem::Expr {
            expr: Expr::column(name),
            alias: None,
        }
    }

    /// Name of the result column this item produces.
    pub fn output_name(&self) -> Option<String> {
        match self {
            SelectItem::Wildcard(_) => None,
            SelectItem::Expr {
                alias: Some(alias), ..
            } => Some(alias.clone()),
            SelectItem::Expr { expr, .. } => Some(expr.output_name()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// One table of a left-deep join chain. The first entry carries no join
/// condition.
#[derive(Clone, Debug, PartialEq)]
pub struct TableRef {
    pub table: TableName,
    pub alias: Option<String>,
    pub join: JoinKind,
    pub on: Option<Expr>,
}

impl TableRef {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            alias: None,
            join: JoinKind::Inner,
            on: None,
        }
    }

    /// Name columns of this table are qualified with.
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub desc: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Update,
    Share,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    pub table: TableName,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
    pub ignore: bool,
    /// `ON DUPLICATE KEY UPDATE` assignments.
    pub on_duplicate: Vec<Assignment>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub table: TableName,
    pub assignments: Vec<Assignment>,
    pub selection: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Delete {
    pub table: TableName,
    pub selection: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

impl BinaryOp {
    fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq => 4,
            BinaryOp::Plus | BinaryOp::Minus => 5,
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => 6,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Value),
    /// Named bind variable, `:name`.
    BindVar(String),
    /// Placeholder for a value list filled in per shard.
    ListArg(String),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<Select>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
        /// `count(*)`.
        star: bool,
    },
    Tuple(Vec<Expr>),
}

pub const AGGREGATES: [&str; 5] = ["count", "sum", "min", "max", "avg"];

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(ColumnRef {
            table: None,
            name: name.into(),
        })
    }

    pub fn qualified_column(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column(ColumnRef {
            table: Some(table.into()),
            name: name.into(),
        })
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::binary(left, BinaryOp::Eq, right)
    }

    pub fn in_list(expr: Expr, list: Vec<Expr>) -> Self {
        Expr::InList {
            expr: Box::new(expr),
            list,
            negated: false,
        }
    }

    /// Always-false predicate, used for empty derived value lists.
    pub fn always_false() -> Self {
        Expr::eq(Expr::Literal(Value::Int(1)), Expr::Literal(Value::Int(0)))
    }

    /// Conjoins `extra` onto an optional predicate.
    pub fn and_opt(base: Option<Expr>, extra: Expr) -> Expr {
        match base {
            Some(base) => Expr::binary(base, BinaryOp::And, extra),
            None => extra,
        }
    }

    /// Joins predicates with AND; `None` when empty.
    pub fn conjoin(parts: Vec<Expr>) -> Option<Expr> {
        parts
            .into_iter()
            .reduce(|acc, part| Expr::binary(acc, BinaryOp::And, part))
    }

    /// Top-level AND operands.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        collect_conjuncts(self, &mut out);
        out
    }

    pub fn as_column(&self) -> Option<&ColumnRef> {
        match self {
            Expr::Column(column) => Some(column),
            _ => None,
        }
    }

    /// Literal or bind variable: a value known before execution.
    pub fn is_value(&self) -> bool {
        matches!(self, Expr::Literal(_) | Expr::BindVar(_))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expr::Function { name, .. } if AGGREGATES.contains(&name.as_str()))
    }

    /// True when an aggregate function appears anywhere in the tree.
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |expr| {
            if expr.is_aggregate() {
                found = true;
            }
        });
        found
    }

    /// Pre-order traversal, not descending into subqueries.
    pub fn walk(&self, visit: &mut dyn FnMut(&Expr)) {
        visit(self);
        match self {
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.walk(visit),
            Expr::InList { expr, list, .. } => {
                expr.walk(visit);
                for item in list {
                    item.walk(visit);
                }
            }
            Expr::InSubquery { expr, .. } => expr.walk(visit),
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.walk(visit);
                low.walk(visit);
                high.walk(visit);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.walk(visit);
                pattern.walk(visit);
            }
            Expr::Function { args, .. } | Expr::Tuple(args) => {
                for arg in args {
                    arg.walk(visit);
                }
            }
            Expr::Column(_) | Expr::Literal(_) | Expr::BindVar(_) | Expr::ListArg(_) => {}
        }
    }

    /// Mutable post-order rewrite; `rewrite` returns a replacement or `None`.
    pub fn rewrite(&mut self, rewrite: &mut dyn FnMut(&Expr) -> Option<Expr>) {
        match self {
            Expr::Binary { left, right, .. } => {
                left.rewrite(rewrite);
                right.rewrite(rewrite);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.rewrite(rewrite),
            Expr::InList { expr, list, .. } => {
                expr.rewrite(rewrite);
                for item in list.iter_mut() {
                    item.rewrite(rewrite);
                }
            }
            Expr::InSubquery { expr, .. } => expr.rewrite(rewrite),
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.rewrite(rewrite);
                low.rewrite(rewrite);
                high.rewrite(rewrite);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.rewrite(rewrite);
                pattern.rewrite(rewrite);
            }
            Expr::Function { args, .. } | Expr::Tuple(args) => {
                for arg in args.iter_mut() {
                    arg.rewrite(rewrite);
                }
            }
            Expr::Column(_) | Expr::Literal(_) | Expr::BindVar(_) | Expr::ListArg(_) => {}
        }
        if let Some(replacement) = rewrite(self) {
            *self = replacement;
        }
    }

    /// Top-down rewrite: a replaced node is not descended into.
    pub fn substitute(&mut self, replace: &mut dyn FnMut(&Expr) -> Option<Expr>) {
        if let Some(replacement) = replace(self) {
            *self = replacement;
            return;
        }
        match self {
            Expr::Binary { left, right, .. } => {
                left.substitute(replace);
                right.substitute(replace);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::InSubquery { expr, .. } => {
                expr.substitute(replace)
            }
            Expr::InList { expr, list, .. } => {
                expr.substitute(replace);
                for item in list.iter_mut() {
                    item.substitute(replace);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.substitute(replace);
                low.substitute(replace);
                high.substitute(replace);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.substitute(replace);
                pattern.substitute(replace);
            }
            Expr::Function { args, .. } | Expr::Tuple(args) => {
                for arg in args.iter_mut() {
                    arg.substitute(replace);
                }
            }
            Expr::Column(_) | Expr::Literal(_) | Expr::BindVar(_) | Expr::ListArg(_) => {}
        }
    }

    /// Every table qualifier referenced by a column; `None` entries stand for
    /// unqualified columns.
    pub fn column_qualifiers(&self) -> Vec<Option<String>> {
        let mut out = Vec::new();
        self.walk(&mut |expr| {
            if let Expr::Column(column) = expr {
                out.push(column.table.clone());
            }
        });
        out
    }

    /// Result column name MySQL would give this expression.
    pub fn output_name(&self) -> String {
        match self {
            Expr::Column(column) => column.name.clone(),
            other => other.to_string(),
        }
    }
}

fn collect_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        other => out.push(other),
    }
}

const RESERVED: &[&str] = &[
    "add", "all", "and", "as", "asc", "between", "by", "case", "cross", "delete", "desc",
    "distinct", "div", "for", "from", "group", "having", "in", "index", "inner", "insert",
    "interval", "into", "is", "join", "key", "keys", "left", "like", "limit", "not", "null",
    "on", "or", "order", "select", "set", "table", "update", "value", "values", "where",
];

/// Writes an identifier, backtick-quoting it when it is not a plain word.
pub fn write_ident(f: &mut impl fmt::Write, ident: &str) -> fmt::Result {
    let plain = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !ident.chars().all(|c| c.is_ascii_digit())
        && !RESERVED.contains(&ident.to_ascii_lowercase().as_str());
    if plain {
        f.write_str(ident)
    } else {
        write!(f, "`{}`", ident.replace('`', "``"))
    }
}

/// Writes a value as a SQL literal.
pub fn write_literal(f: &mut impl fmt::Write, value: &Value) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Int(v) => write!(f, "{v}"),
        Value::Float(v) => {
            if v.is_finite() && v.fract() == 0.0 {
                write!(f, "{v:.1}")
            } else {
                write!(f, "{v}")
            }
        }
        Value::Text(s) => {
            f.write_char('\'')?;
            for c in s.chars() {
                match c {
                    '\'' => f.write_str("''")?,
                    '\\' => f.write_str("\\\\")?,
                    other => f.write_char(other)?,
                }
            }
            f.write_char('\'')
        }
        Value::Bytes(b) => write!(f, "X'{}'", hex::encode(b)),
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(qualifier) = &self.qualifier {
            write_ident(f, qualifier)?;
            f.write_char('.')?;
        }
        write_ident(f, &self.name)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(table) = &self.table {
            write_ident(f, table)?;
            f.write_char('.')?;
        }
        write_ident(f, &self.name)
    }
}

impl Expr {
    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Unary { op: UnaryOp::Not, .. } => 3,
            Expr::IsNull { .. }
            | Expr::InList { .. }
            | Expr::InSubquery { .. }
            | Expr::Between { .. }
            | Expr::Like { .. } => 4,
            _ => 10,
        }
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, parent: u8) -> fmt::Result {
        if self.precedence() <= parent && self.precedence() < 10 {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(column) => write!(f, "{column}"),
            Expr::Literal(value) => write_literal(f, value),
            Expr::BindVar(name) => write!(f, ":{name}"),
            Expr::ListArg(name) => write!(f, "::{name}"),
            Expr::Binary { left, op, right } => {
                let prec = op.precedence();
                // Left-associative: equal precedence on the left needs no parens.
                if left.precedence() < prec {
                    write!(f, "({left})")?;
                } else {
                    write!(f, "{left}")?;
                }
                write!(f, " {} ", op.symbol())?;
                right.fmt_child(f, prec)
            }
            Expr::Unary { op: UnaryOp::Not, expr } => {
                f.write_str("not ")?;
                expr.fmt_child(f, 3)
            }
            Expr::Unary { op: UnaryOp::Neg, expr } => {
                f.write_char('-')?;
                expr.fmt_child(f, 9)
            }
            Expr::IsNull { expr, negated } => {
                expr.fmt_child(f, 4)?;
                f.write_str(if *negated { " is not null" } else { " is null" })
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                expr.fmt_child(f, 4)?;
                f.write_str(if *negated { " not in (" } else { " in (" })?;
                write_list(f, list)?;
                f.write_char(')')
            }
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                expr.fmt_child(f, 4)?;
                write!(
                    f,
                    "{}({subquery})",
                    if *negated { " not in " } else { " in " }
                )
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                expr.fmt_child(f, 4)?;
                f.write_str(if *negated { " not between " } else { " between " })?;
                low.fmt_child(f, 4)?;
                f.write_str(" and ")?;
                high.fmt_child(f, 4)
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                expr.fmt_child(f, 4)?;
                f.write_str(if *negated { " not like " } else { " like " })?;
                pattern.fmt_child(f, 4)
            }
            Expr::Function {
                name,
                args,
                distinct,
                star,
            } => {
                write!(f, "{name}(")?;
                if *star {
                    f.write_char('*')?;
                } else {
                    if *distinct {
                        f.write_str("distinct ")?;
                    }
                    write_list(f, args)?;
                }
                f.write_char(')')
            }
            Expr::Tuple(items) => {
                f.write_char('(')?;
                write_list(f, items)?;
                f.write_char(')')
            }
        }
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::Wildcard(None) => f.write_char('*'),
            SelectItem::Wildcard(Some(table)) => {
                write_ident(f, table)?;
                f.write_str(".*")
            }
            SelectItem::Expr { expr, alias } => {
                write!(f, "{expr}")?;
                if let Some(alias) = alias {
                    f.write_str(" as ")?;
                    write_ident(f, alias)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        f.write_str(if self.desc { " desc" } else { " asc" })
    }
}

fn write_order_limit(
    f: &mut fmt::Formatter<'_>,
    order_by: &[OrderBy],
    limit: Option<&Expr>,
    offset: Option<&Expr>,
) -> fmt::Result {
    if !order_by.is_empty() {
        f.write_str(" order by ")?;
        write_list(f, order_by)?;
    }
    if let Some(limit) = limit {
        write!(f, " limit {limit}")?;
        if let Some(offset) = offset {
            write!(f, " offset {offset}")?;
        }
    }
    Ok(())
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("select ")?;
        if self.distinct {
            f.write_str("distinct ")?;
        }
        write_list(f, &self.projection)?;
        for (idx, table) in self.from.iter().enumerate() {
            if idx == 0 {
                f.write_str(" from ")?;
            } else {
                f.write_str(match table.join {
                    JoinKind::Inner => " inner join ",
                    JoinKind::Left => " left outer join ",
                })?;
            }
            write!(f, "{}", table.table)?;
            if let Some(alias) = &table.alias {
                f.write_str(" as ")?;
                write_ident(f, alias)?;
            }
            if let Some(on) = &table.on {
                write!(f, " on {on}")?;
            }
        }
        if let Some(selection) = &self.selection {
            write!(f, " where {selection}")?;
        }
        if !self.group_by.is_empty() {
            f.write_str(" group by ")?;
            write_list(f, &self.group_by)?;
        }
        if let Some(having) = &self.having {
            write!(f, " having {having}")?;
        }
        write_order_limit(f, &self.order_by, self.limit.as_ref(), self.offset.as_ref())?;
        match self.lock {
            Some(LockMode::Update) => f.write_str(" for update"),
            Some(LockMode::Share) => f.write_str(" for share"),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_ident(f, &self.column)?;
        write!(f, " = {}", self.value)
    }
}

impl fmt::Display for Insert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.ignore {
            "insert ignore into "
        } else {
            "insert into "
        })?;
        write!(f, "{}", self.table)?;
        if !self.columns.is_empty() {
            f.write_str(" (")?;
            for (idx, column) in self.columns.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write_ident(f, column)?;
            }
            f.write_char(')')?;
        }
        f.write_str(" values ")?;
        for (idx, row) in self.rows.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            f.write_char('(')?;
            write_list(f, row)?;
            f.write_char(')')?;
        }
        if !self.on_duplicate.is_empty() {
            f.write_str(" on duplicate key update ")?;
            write_list(f, &self.on_duplicate)?;
        }
        Ok(())
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "update {} set ", self.table)?;
        write_list(f, &self.assignments)?;
        if let Some(selection) = &self.selection {
            write!(f, " where {selection}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Delete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delete from {}", self.table)?;
        if let Some(selection) = &self.selection {
            write!(f, " where {selection}")?;
        }
        write_order_limit(f, &self.order_by, self.limit.as_ref(), None)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(select) => write!(f, "{select}"),
            Statement::Insert(insert) => write!(f, "{insert}"),
            Statement::Update(update) => write!(f, "{update}"),
            Statement::Delete(delete) => write!(f, "{delete}"),
            Statement::Truncate(table) => write!(f, "truncate table {table}"),
            Statement::Begin => f.write_str("begin"),
            Statement::Commit => f.write_str("commit"),
            Statement::Rollback => f.write_str("rollback"),
            Statement::Use { keyspace, role } => {
                f.write_str("use")?;
                if let Some(keyspace) = keyspace {
                    f.write_char(' ')?;
                    write_ident(f, keyspace)?;
                    if let Some(role) = role {
                        write!(f, "@{role}")?;
                    }
                }
                Ok(())
            }
            Statement::NextValues { count, sequence } => {
                write!(f, "select next {count} values from {sequence}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_with_minimal_parentheses() {
        let expr = Expr::binary(
            Expr::binary(
                Expr::eq(Expr::column("a"), Expr::literal(1)),
                BinaryOp::Or,
                Expr::eq(Expr::column("b"), Expr::literal(2)),
            ),
            BinaryOp::And,
            Expr::eq(Expr::column("c"), Expr::literal("x'y")),
        );
        assert_eq!(expr.to_string(), "(a = 1 or b = 2) and c = 'x''y'");
    }

    #[test]
    fn quotes_reserved_identifiers_and_bytes() {
        let select = Select {
            selection: Some(Expr::eq(
                Expr::column("keyspace_id"),
                Expr::Literal(Value::Bytes(vec![0x16, 0x6b])),
            )),
            ..Select::simple(vec![SelectItem::column("key")], TableName::qualified("lookup", "order"))
        };
        assert_eq!(
            select.to_string(),
            "select `key` from lookup.`order` where keyspace_id = X'166b'"
        );
    }

    #[test]
    fn conjuncts_flatten_nested_and() {
        let expr = Expr::conjoin(vec![
            Expr::eq(Expr::column("a"), Expr::literal(1)),
            Expr::eq(Expr::column("b"), Expr::literal(2)),
            Expr::eq(Expr::column("c"), Expr::literal(3)),
        ])
        .expect("non-empty");
        assert_eq!(expr.conjuncts().len(), 3);
        assert_eq!(expr.to_string(), "a = 1 and b = 2 and c = 3");
    }

    #[test]
    fn insert_renders_upsert_clause() {
        let insert = Insert {
            table: TableName::new("music"),
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![Expr::literal(1), Expr::literal("a")]],
            ignore: false,
            on_duplicate: vec![Assignment {
                column: "name".into(),
                value: Expr::Function {
                    name: "values".into(),
                    args: vec![Expr::column("name")],
                    distinct: false,
                    star: false,
                },
            }],
        };
        assert_eq!(
            insert.to_string(),
            "insert into music (id, name) values (1, 'a') on duplicate key update name = values(name)"
        );
    }
}

//! SQL front end: statement tree, parser adapter, and row evaluation.

pub mod aggregate;
pub mod ast;
pub mod eval;
pub mod parse;
pub mod query;

pub use ast::{Expr, Select, SelectItem, Statement, TableName};
pub use parse::{parse, parse_statement, Directives, ParsedStatement};

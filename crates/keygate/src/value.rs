//! SQL values, result sets and the collation used to compare them.
//!
//! Text compares case-insensitively with trailing spaces ignored, the way the
//! shards' default collation does, so grouping, ordering and lookup matching
//! at the router agree with what each shard computed locally.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Named bind variables supplied with a statement (`:name` in SQL).
pub type BindVars = BTreeMap<String, Value>;

/// One result row.
pub type Row = Vec<Value>;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn text(raw: impl Into<String>) -> Self {
        Value::Text(raw.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view used by numeric vindexes and LIMIT/OFFSET.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Text(s) => s.trim().parse::<i64>().ok(),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Unsigned integer view; negative integers keep their bit pattern.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Text(s) => {
                let s = s.trim();
                s.parse::<u64>()
                    .ok()
                    .or_else(|| s.parse::<i64>().ok().map(|v| v as u64))
            }
            other => other.as_i64().map(|v| v as u64),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse::<f64>().ok(),
            Value::Null => None,
        }
    }

    /// Raw bytes of the value as a shard would store it in a binary column.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bytes(b) => b.clone(),
            Value::Text(s) => s.as_bytes().to_vec(),
            Value::Null => Vec::new(),
            other => other.to_string().into_bytes(),
        }
    }

    /// MySQL truthiness: non-zero numbers are true, NULL is false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            other => other.as_f64().map(|v| v != 0.0).unwrap_or(false),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Total order over values under the router's collation.
    ///
    /// NULL sorts first. Numbers compare numerically, also against text that
    /// parses as a number. Text compares case-insensitively.
    pub fn collate_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => cmp_text_ci(a, b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (a, b) if a.is_numeric() || b.is_numeric() => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                // Decision: numbers order before non-numeric text.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            (Value::Text(a), Value::Bytes(b)) => a.as_bytes().cmp(b.as_slice()),
            (Value::Bytes(a), Value::Text(b)) => a.as_slice().cmp(b.as_bytes()),
            _ => Ordering::Equal,
        }
    }

    /// SQL equality; `None` when either side is NULL.
    pub fn sql_eq(&self, other: &Value) -> Option<bool> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.collate_cmp(other) == Ordering::Equal)
    }
}

fn cmp_text_ci(a: &str, b: &str) -> Ordering {
    let a = a.trim_end_matches(' ');
    let b = b.trim_end_matches(' ');
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Wrapper giving `Value` slices a total order for use as map keys.
#[derive(Clone, Debug)]
pub struct CollatedKey(pub Vec<Value>);

impl PartialEq for CollatedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CollatedKey {}

impl PartialOrd for CollatedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CollatedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = a.collate_cmp(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Null,
    Int64,
    Float64,
    VarChar,
    VarBinary,
}

impl FieldType {
    /// Parses a declared column type (`BIGINT`, `VARCHAR(64)`, ...).
    pub fn from_declared(raw: &str) -> Self {
        let upper = raw.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or_default().trim();
        match base {
            "BIGINT" | "INT" | "INTEGER" | "SMALLINT" | "TINYINT" | "MEDIUMINT" | "INT64" => {
                FieldType::Int64
            }
            "FLOAT" | "DOUBLE" | "DECIMAL" | "FLOAT64" => FieldType::Float64,
            "VARBINARY" | "BINARY" | "BLOB" => FieldType::VarBinary,
            _ => FieldType::VarChar,
        }
    }

    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => FieldType::Null,
            Value::Int(_) => FieldType::Int64,
            Value::Float(_) => FieldType::Float64,
            Value::Text(_) => FieldType::VarChar,
            Value::Bytes(_) => FieldType::VarBinary,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Logical result of one statement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    pub fn with_fields(fields: Vec<Field>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    /// Rows returned, or rows affected for DML.
    pub fn row_count(&self) -> u64 {
        if self.fields.is_empty() {
            self.rows_affected
        } else {
            self.rows.len() as u64
        }
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Position of a column by case-insensitive name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_collation_ignores_case_and_trailing_spaces() {
        assert_eq!(Value::text("Abc").collate_cmp(&Value::text("aBC ")), Ordering::Equal);
        assert_eq!(Value::text("a").collate_cmp(&Value::text("B")), Ordering::Less);
        assert_eq!(Value::text("E").collate_cmp(&Value::text("d")), Ordering::Greater);
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(Value::Int(10).collate_cmp(&Value::text("9")), Ordering::Greater);
        assert_eq!(Value::Int(3).collate_cmp(&Value::Float(3.0)), Ordering::Equal);
        assert_eq!(Value::Null.collate_cmp(&Value::Int(i64::MIN)), Ordering::Less);
        assert_eq!(Value::Int(1).sql_eq(&Value::Null), None);
        assert_eq!(Value::text("1").sql_eq(&Value::Int(1)), Some(true));
    }

    #[test]
    fn collated_keys_group_case_insensitively() {
        let mut groups = BTreeMap::new();
        for name in ["A", "a", "b", "B", "c"] {
            *groups.entry(CollatedKey(vec![Value::text(name)])).or_insert(0) += 1;
        }
        assert_eq!(groups.len(), 3);
        assert_eq!(groups.values().copied().collect::<Vec<_>>(), vec![2, 2, 1]);
    }

    #[test]
    fn declared_types_map_to_field_types() {
        assert_eq!(FieldType::from_declared("bigint"), FieldType::Int64);
        assert_eq!(FieldType::from_declared("VARCHAR(64)"), FieldType::VarChar);
        assert_eq!(FieldType::from_declared("binary(8)"), FieldType::VarBinary);
    }

    #[test]
    fn row_count_reports_affected_rows_for_dml() {
        assert_eq!(QueryResult::affected(3).row_count(), 3);
        let mut result = QueryResult::with_fields(vec![Field::new("id", FieldType::Int64)]);
        result.rows.push(vec![Value::Int(1)]);
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.column_index("ID"), Some(0));
    }
}

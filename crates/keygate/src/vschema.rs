//! Schema of keyspaces, tables and vindexes.
//!
//! The schema is loaded from a JSON document (`VSchemaSource`) and validated
//! into an immutable `VSchema` snapshot. Shard key ranges are not part of the
//! document; topology supplies them when the snapshot is built. Names match
//! case-insensitively; original case is kept for output.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::key::{KeyRange, KeyspaceId};
use crate::sql::ast::TableName;
use crate::value::FieldType;
use crate::vindex::Vindex;

/// Wire model of the whole schema document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VSchemaSource {
    #[serde(default)]
    pub keyspaces: BTreeMap<String, KeyspaceDoc>,
}

impl VSchemaSource {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("decode vschema json")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read vschema file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parse vschema file {}", path.display()))
    }

    /// Adds or replaces one keyspace document.
    pub fn with_keyspace(mut self, name: impl Into<String>, doc: KeyspaceDoc) -> Self {
        self.keyspaces.insert(name.into(), doc);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyspaceDoc {
    #[serde(default)]
    pub sharded: bool,
    #[serde(default)]
    pub vindexes: BTreeMap<String, VindexDoc>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableDoc>,
}

impl KeyspaceDoc {
    /// Parses a single keyspace document.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("decode keyspace vschema json")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VindexDoc {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDoc {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub column_vindexes: Vec<ColumnVindexDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<AutoIncrementDoc>,
    #[serde(default)]
    pub columns: Vec<ColumnDoc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnVindexDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoIncrementDoc {
    pub column: String,
    pub sequence: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDoc {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub column_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardInfo {
    pub name: String,
    pub key_range: KeyRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Normal,
    Sequence,
}

#[derive(Clone, Debug)]
pub struct ColumnVindex {
    pub columns: Vec<String>,
    pub vindex: Arc<Vindex>,
}

impl ColumnVindex {
    /// True when this binding maintains its vindex on `table`'s writes.
    pub fn is_owned_by(&self, table: &str) -> bool {
        self.vindex
            .owner
            .as_deref()
            .is_some_and(|owner| owner.eq_ignore_ascii_case(table))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoIncrement {
    pub column: String,
    /// Sequence table, always keyspace-qualified.
    pub sequence: TableName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub field_type: FieldType,
}

#[derive(Clone, Debug)]
pub struct Table {
    pub name: String,
    pub keyspace: String,
    pub kind: TableKind,
    /// First entry is the primary vindex.
    pub column_vindexes: Vec<ColumnVindex>,
    pub auto_increment: Option<AutoIncrement>,
    pub columns: Vec<ColumnDef>,
}

impl Table {
    /// Undeclared table of an unsharded keyspace.
    fn implicit(name: &str, keyspace: &str) -> Self {
        Self {
            name: name.to_string(),
            keyspace: keyspace.to_string(),
            kind: TableKind::Normal,
            column_vindexes: Vec::new(),
            auto_increment: None,
            columns: Vec::new(),
        }
    }

    pub fn primary(&self) -> Option<&ColumnVindex> {
        self.column_vindexes.first()
    }

    /// Secondary bindings owned by this table.
    pub fn owned_vindexes(&self) -> impl Iterator<Item = &ColumnVindex> {
        self.column_vindexes
            .iter()
            .skip(1)
            .filter(|cv| cv.is_owned_by(&self.name))
    }

    pub fn column_type(&self, column: &str) -> Option<FieldType> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .map(|c| c.field_type)
    }

    pub fn qualified_name(&self) -> TableName {
        TableName::qualified(self.keyspace.clone(), self.name.clone())
    }
}

#[derive(Clone, Debug)]
pub struct Keyspace {
    pub name: String,
    pub sharded: bool,
    /// Sorted by key range start.
    pub shards: Vec<ShardInfo>,
    tables: BTreeMap<String, Arc<Table>>,
    vindexes: BTreeMap<String, Arc<Vindex>>,
}

impl Keyspace {
    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn vindex(&self, name: &str) -> Option<Arc<Vindex>> {
        self.vindexes.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.tables.values()
    }

    /// Shard owning `ksid`.
    pub fn shard_for(&self, ksid: &KeyspaceId) -> Option<&ShardInfo> {
        self.shards.iter().find(|s| s.key_range.contains(ksid))
    }

    /// Shards overlapping `range`, in key order.
    pub fn shards_overlapping(&self, range: &KeyRange) -> Vec<&ShardInfo> {
        self.shards
            .iter()
            .filter(|s| s.key_range.overlaps(range))
            .collect()
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.name.clone()).collect()
    }
}

/// Validated, immutable schema snapshot.
#[derive(Clone, Debug, Default)]
pub struct VSchema {
    keyspaces: BTreeMap<String, Arc<Keyspace>>,
    /// Lowercase table name to the keyspaces declaring it.
    table_index: HashMap<String, Vec<String>>,
    pub source: Arc<VSchemaSource>,
}

impl VSchema {
    /// Validates `source` and attaches the shard names topology reports for
    /// each keyspace.
    pub fn build(
        source: Arc<VSchemaSource>,
        shard_names: &dyn Fn(&str) -> Vec<String>,
    ) -> GateResult<Self> {
        let mut keyspaces = BTreeMap::new();
        let mut table_index: HashMap<String, Vec<String>> = HashMap::new();
        let mut sequences: HashMap<String, Vec<String>> = HashMap::new();

        for (ks_name, doc) in &source.keyspaces {
            for (table_name, table) in &doc.tables {
                table_index
                    .entry(table_name.to_ascii_lowercase())
                    .or_default()
                    .push(ks_name.clone());
                if table.kind.as_deref() == Some("sequence") {
                    if doc.sharded {
                        return Err(GateError::schema(format!(
                            "sequence table {ks_name}.{table_name} must live in an unsharded keyspace"
                        )));
                    }
                    sequences
                        .entry(table_name.to_ascii_lowercase())
                        .or_default()
                        .push(ks_name.clone());
                }
            }
        }

        for (ks_name, doc) in &source.keyspaces {
            let keyspace = build_keyspace(ks_name, doc, &source, &table_index, &sequences, shard_names)?;
            keyspaces.insert(ks_name.to_ascii_lowercase(), Arc::new(keyspace));
        }

        Ok(Self {
            keyspaces,
            table_index,
            source,
        })
    }

    pub fn keyspace(&self, name: &str) -> GateResult<Arc<Keyspace>> {
        self.keyspaces
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| GateError::schema(format!("keyspace {name} not found in vschema")))
    }

    pub fn keyspaces(&self) -> impl Iterator<Item = &Arc<Keyspace>> {
        self.keyspaces.values()
    }

    /// Resolves a table: explicit qualifier, then the session's target
    /// keyspace, then the unique keyspace declaring the name.
    pub fn resolve_table(&self, name: &TableName, target: Option<&str>) -> GateResult<Arc<Table>> {
        if let Some(ks_name) = name.qualifier.as_deref().or(target) {
            let keyspace = self.keyspace(ks_name)?;
            if let Some(table) = keyspace.table(&name.name) {
                return Ok(table);
            }
            if !keyspace.sharded {
                return Ok(Arc::new(Table::implicit(&name.name, &keyspace.name)));
            }
            return Err(GateError::schema(format!("table {} not found in schema", name.name)));
        }
        match self.table_index.get(&name.name.to_ascii_lowercase()).map(Vec::as_slice) {
            Some([only]) => self
                .keyspace(only)?
                .table(&name.name)
                .ok_or_else(|| GateError::schema(format!("table {} not found in schema", name.name))),
            Some([_, _, ..]) => Err(GateError::schema(format!(
                "ambiguous table reference: {}",
                name.name
            ))),
            _ => Err(GateError::schema(format!("table {} not found in schema", name.name))),
        }
    }

    /// Resolves a vindex addressed like a table (vindex function reads).
    pub fn resolve_vindex(&self, name: &TableName, target: Option<&str>) -> Option<Arc<Vindex>> {
        if let Some(ks_name) = name.qualifier.as_deref().or(target) {
            return self.keyspace(ks_name).ok()?.vindex(&name.name);
        }
        let mut found = self.keyspaces.values().filter_map(|ks| ks.vindex(&name.name));
        let first = found.next()?;
        // Decision: an unqualified vindex name declared in several keyspaces is not resolved.
        if found.next().is_some() {
            return None;
        }
        Some(first)
    }
}

fn build_keyspace(
    ks_name: &str,
    doc: &KeyspaceDoc,
    source: &VSchemaSource,
    table_index: &HashMap<String, Vec<String>>,
    sequences: &HashMap<String, Vec<String>>,
    shard_names: &dyn Fn(&str) -> Vec<String>,
) -> GateResult<Keyspace> {
    let mut shards = Vec::new();
    for name in shard_names(ks_name) {
        let key_range = KeyRange::parse(&name).map_err(|err| {
            GateError::schema(format!("keyspace {ks_name}: invalid shard name {name}: {err:#}"))
        })?;
        shards.push(ShardInfo { name, key_range });
    }
    shards.sort_by_key(|s| s.key_range.start_u128());
    if !doc.sharded && shards.len() > 1 {
        return Err(GateError::schema(format!(
            "keyspace {ks_name}: unsharded keyspace has {} shards",
            shards.len()
        )));
    }

    let mut vindexes = BTreeMap::new();
    for (name, vdoc) in &doc.vindexes {
        let mut vindex = Vindex::from_type(name, ks_name, &vdoc.kind, &vdoc.params, vdoc.owner.clone())?;
        if let Some(owner) = &vindex.owner {
            if !doc.tables.keys().any(|t| t.eq_ignore_ascii_case(owner)) {
                return Err(GateError::schema(format!(
                    "vindex {name}: owner table {owner} not found in keyspace {ks_name}"
                )));
            }
        }
        if let crate::vindex::VindexKind::Lookup(params) = &mut vindex.kind {
            params.table = qualify_lookup_table(name, &params.table, source, table_index)?;
        }
        vindexes.insert(name.to_ascii_lowercase(), Arc::new(vindex));
    }

    let mut tables = BTreeMap::new();
    for (table_name, tdoc) in &doc.tables {
        let kind = match tdoc.kind.as_deref() {
            None | Some("") => TableKind::Normal,
            Some("sequence") => TableKind::Sequence,
            Some(other) => {
                return Err(GateError::schema(format!(
                    "table {table_name}: unknown table type {other}"
                )))
            }
        };

        let mut column_vindexes = Vec::with_capacity(tdoc.column_vindexes.len());
        for binding in &tdoc.column_vindexes {
            let vindex = vindexes
                .get(&binding.name.to_ascii_lowercase())
                .cloned()
                .ok_or_else(|| {
                    GateError::schema(format!(
                        "table {table_name}: vindex {} not found in keyspace {ks_name}",
                        binding.name
                    ))
                })?;
            let columns: Vec<String> = match (&binding.column, binding.columns.is_empty()) {
                (Some(column), true) => vec![column.clone()],
                (None, false) => binding.columns.clone(),
                _ => {
                    return Err(GateError::schema(format!(
                        "table {table_name}: vindex {} must name either column or columns",
                        binding.name
                    )))
                }
            };
            if columns.len() != vindex.arity() {
                return Err(GateError::schema(format!(
                    "table {table_name}: vindex {} expects {} columns, got {}",
                    binding.name,
                    vindex.arity(),
                    columns.len()
                )));
            }
            column_vindexes.push(ColumnVindex { columns, vindex });
        }

        if doc.sharded && kind == TableKind::Normal {
            match column_vindexes.first() {
                None => {
                    return Err(GateError::schema(format!(
                        "table {table_name}: missing primary vindex"
                    )))
                }
                Some(primary) if !primary.vindex.is_unique() => {
                    return Err(GateError::schema(format!(
                        "table {table_name}: primary vindex {} is not unique",
                        primary.vindex.name
                    )))
                }
                Some(primary) if primary.is_owned_by(table_name) => {
                    return Err(GateError::schema(format!(
                        "table {table_name}: primary vindex {} cannot be owned",
                        primary.vindex.name
                    )))
                }
                Some(_) => {}
            }
        }

        let auto_increment = match &tdoc.auto_increment {
            None => None,
            Some(auto) => Some(AutoIncrement {
                column: auto.column.clone(),
                sequence: resolve_sequence(table_name, &auto.sequence, sequences)?,
            }),
        };

        let columns = tdoc
            .columns
            .iter()
            .map(|c| ColumnDef {
                name: c.name.clone(),
                field_type: c
                    .column_type
                    .as_deref()
                    .map(FieldType::from_declared)
                    .unwrap_or(FieldType::VarChar),
            })
            .collect();

        tables.insert(
            table_name.to_ascii_lowercase(),
            Arc::new(Table {
                name: table_name.clone(),
                keyspace: ks_name.to_string(),
                kind,
                column_vindexes,
                auto_increment,
                columns,
            }),
        );
    }

    Ok(Keyspace {
        name: ks_name.to_string(),
        sharded: doc.sharded,
        shards,
        tables,
        vindexes,
    })
}

fn qualify_lookup_table(
    vindex: &str,
    table: &TableName,
    source: &VSchemaSource,
    table_index: &HashMap<String, Vec<String>>,
) -> GateResult<TableName> {
    if let Some(qualifier) = &table.qualifier {
        let Some((ks_name, doc)) = source
            .keyspaces
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(qualifier))
        else {
            return Err(GateError::schema(format!(
                "vindex {vindex}: keyspace {qualifier} not found in vschema"
            )));
        };
        if doc.sharded && !doc.tables.keys().any(|t| t.eq_ignore_ascii_case(&table.name)) {
            return Err(GateError::schema(format!(
                "vindex {vindex}: lookup table {table} not found in schema"
            )));
        }
        return Ok(TableName::qualified(ks_name.clone(), table.name.clone()));
    }
    match table_index.get(&table.name.to_ascii_lowercase()).map(Vec::as_slice) {
        Some([only]) => Ok(TableName::qualified(only.clone(), table.name.clone())),
        _ => Err(GateError::schema(format!(
            "vindex {vindex}: lookup table {} must be qualified or declared in exactly one keyspace",
            table.name
        ))),
    }
}

fn resolve_sequence(
    table: &str,
    sequence: &str,
    sequences: &HashMap<String, Vec<String>>,
) -> GateResult<TableName> {
    let name = TableName::parse(sequence);
    let declared = sequences.get(&name.name.to_ascii_lowercase());
    let keyspace = match (&name.qualifier, declared.map(Vec::as_slice)) {
        (Some(q), Some(list)) => list.iter().find(|ks| ks.eq_ignore_ascii_case(q)).cloned(),
        (None, Some([only])) => Some(only.clone()),
        _ => None,
    };
    keyspace
        .map(|ks| TableName::qualified(ks, name.name.clone()))
        .ok_or_else(|| {
            GateError::schema(format!(
                "table {table}: sequence {sequence} not found or not declared as a sequence table"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "keyspaces": {
        "user": {
          "sharded": true,
          "vindexes": {
            "hash_index": {"type": "hash"},
            "name_map": {"type": "lookup_hash",
                         "params": {"table": "lookup.name_map", "from": "name", "to": "user_id"},
                         "owner": "user"}
          },
          "tables": {
            "user": {
              "column_vindexes": [{"column": "id", "name": "hash_index"},
                                  {"column": "name", "name": "name_map"}],
              "auto_increment": {"column": "id", "sequence": "user_seq"},
              "columns": [{"name": "id", "type": "BIGINT"}, {"name": "name", "type": "VARCHAR"}]
            }
          }
        },
        "lookup": {
          "tables": {"name_map": {}, "user_seq": {"type": "sequence"}}
        }
      }
    }"#;

    fn shards(ks: &str) -> Vec<String> {
        if ks == "user" {
            vec!["80-".to_string(), "-80".to_string()]
        } else {
            vec!["0".to_string()]
        }
    }

    fn build(raw: &str) -> GateResult<VSchema> {
        let source = VSchemaSource::from_json(raw).expect("json");
        VSchema::build(Arc::new(source), &shards)
    }

    #[test]
    fn builds_and_resolves_tables() {
        let vschema = build(SAMPLE).expect("build");
        let user = vschema.keyspace("USER").expect("keyspace");
        assert_eq!(user.shard_names(), vec!["-80", "80-"]);

        let table = vschema.resolve_table(&TableName::new("User"), None).expect("table");
        assert_eq!(table.keyspace, "user");
        assert_eq!(table.primary().expect("primary").vindex.name, "hash_index");
        assert_eq!(table.owned_vindexes().count(), 1);
        assert_eq!(
            table.auto_increment.as_ref().expect("auto inc").sequence,
            TableName::qualified("lookup", "user_seq")
        );
        assert_eq!(table.column_type("ID"), Some(FieldType::Int64));

        let implicit = vschema
            .resolve_table(&TableName::qualified("lookup", "other"), None)
            .expect("unsharded implicit table");
        assert_eq!(implicit.keyspace, "lookup");

        let err = vschema
            .resolve_table(&TableName::new("missing"), Some("user"))
            .expect_err("unknown table");
        assert_eq!(err.to_string(), "table missing not found in schema");
        let err = vschema
            .resolve_table(&TableName::qualified("nope", "t"), None)
            .expect_err("unknown keyspace");
        assert_eq!(err.to_string(), "keyspace nope not found in vschema");
    }

    #[test]
    fn rejects_non_unique_primary_and_unknown_vindex() {
        let raw = SAMPLE.replace(r#"{"column": "id", "name": "hash_index"},"#, "");
        let err = build(&raw).expect_err("non-unique primary");
        assert!(err.to_string().contains("is not unique"), "{err}");

        let raw = SAMPLE.replace(r#""name": "hash_index"}"#, r#""name": "nope"}"#);
        let err = build(&raw).expect_err("unknown vindex");
        assert!(err.to_string().contains("vindex nope not found"), "{err}");

        let raw = SAMPLE.replace(r#""sequence": "user_seq""#, r#""sequence": "other_seq""#);
        let err = build(&raw).expect_err("undeclared sequence");
        assert!(err.to_string().contains("sequence other_seq"), "{err}");
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("vschema.json");
        std::fs::write(&path, SAMPLE).expect("write");
        let source = VSchemaSource::from_file(&path).expect("load");
        assert_eq!(source.keyspaces.len(), 2);
        assert!(VSchemaSource::from_file(dir.path().join("missing.json")).is_err());
    }
}

//! Vindexes: functions from column values to keyspace ids.
//!
//! Functional vindexes compute the id directly. Lookup vindexes keep the
//! mapping in a backing table reached through `lookup::LookupStore`; this
//! module only describes them and converts between stored values and ids.

use std::fmt;
use std::sync::OnceLock;

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde3;
use md5::{Digest, Md5};
use xxhash_rust::xxh64::xxh64;

use crate::error::{GateError, GateResult};
use crate::key::KeyspaceId;
use crate::sql::ast::TableName;
use crate::value::Value;

/// What a lookup table stores in its `to` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupStore {
    /// The raw 8-byte keyspace id.
    KeyspaceId,
    /// The integer that the hash vindex maps to the keyspace id.
    HashedInt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupParams {
    pub table: TableName,
    pub from: Vec<String>,
    pub to: String,
    pub unique: bool,
    pub store: LookupStore,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VindexKind {
    Hash,
    UnicodeLooseHash,
    UnicodeLooseMd5,
    Lookup(LookupParams),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vindex {
    pub name: String,
    pub keyspace: String,
    pub kind: VindexKind,
    /// Owner table; only lookup vindexes can be owned.
    pub owner: Option<String>,
}

impl Vindex {
    /// Builds a vindex from its schema type name and parameters.
    pub fn from_type(
        name: &str,
        keyspace: &str,
        type_name: &str,
        params: &std::collections::BTreeMap<String, String>,
        owner: Option<String>,
    ) -> GateResult<Self> {
        let lookup = |unique: bool, store: LookupStore| -> GateResult<VindexKind> {
            let param = |key: &str| {
                params
                    .get(key)
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| {
                        GateError::schema(format!("vindex {name}: missing lookup parameter {key}"))
                    })
            };
            let from = param("from")?
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>();
            Ok(VindexKind::Lookup(LookupParams {
                table: TableName::parse(&param("table")?),
                from,
                to: param("to")?,
                unique,
                store,
            }))
        };
        let kind = match type_name.to_ascii_lowercase().as_str() {
            "hash" => VindexKind::Hash,
            "unicode_loose_hash" | "unicode_loose_xxhash" => VindexKind::UnicodeLooseHash,
            "unicode_loose_md5" => VindexKind::UnicodeLooseMd5,
            "lookup" => lookup(false, LookupStore::KeyspaceId)?,
            "lookup_unique" => lookup(true, LookupStore::KeyspaceId)?,
            "lookup_hash" => lookup(false, LookupStore::HashedInt)?,
            "lookup_hash_unique" => lookup(true, LookupStore::HashedInt)?,
            other => {
                return Err(GateError::schema(format!(
                    "vindex {name}: unknown vindex type {other}"
                )))
            }
        };
        if owner.is_some() && !matches!(kind, VindexKind::Lookup(_)) {
            return Err(GateError::schema(format!(
                "vindex {name}: only lookup vindexes can have an owner"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            keyspace: keyspace.to_string(),
            kind,
            owner,
        })
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            VindexKind::Hash => "hash",
            VindexKind::UnicodeLooseHash => "unicode_loose_hash",
            VindexKind::UnicodeLooseMd5 => "unicode_loose_md5",
            VindexKind::Lookup(p) => match (p.store, p.unique) {
                (LookupStore::KeyspaceId, false) => "lookup",
                (LookupStore::KeyspaceId, true) => "lookup_unique",
                (LookupStore::HashedInt, false) => "lookup_hash",
                (LookupStore::HashedInt, true) => "lookup_hash_unique",
            },
        }
    }

    pub fn is_unique(&self) -> bool {
        match &self.kind {
            VindexKind::Hash | VindexKind::UnicodeLooseHash | VindexKind::UnicodeLooseMd5 => true,
            VindexKind::Lookup(p) => p.unique,
        }
    }

    pub fn is_functional(&self) -> bool {
        !matches!(self.kind, VindexKind::Lookup(_))
    }

    pub fn is_reversible(&self) -> bool {
        matches!(self.kind, VindexKind::Hash)
    }

    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    pub fn lookup(&self) -> Option<&LookupParams> {
        match &self.kind {
            VindexKind::Lookup(p) => Some(p),
            _ => None,
        }
    }

    /// Number of input columns.
    pub fn arity(&self) -> usize {
        self.lookup().map(|p| p.from.len()).unwrap_or(1)
    }

    /// Relative resolution cost; cheaper vindexes win when several apply.
    pub fn cost(&self) -> u32 {
        match &self.kind {
            VindexKind::Hash | VindexKind::UnicodeLooseHash | VindexKind::UnicodeLooseMd5 => 1,
            VindexKind::Lookup(p) if p.unique => 10,
            VindexKind::Lookup(_) => 20,
        }
    }

    /// Maps one value through a functional vindex. NULL maps to `None`.
    pub fn map_functional(&self, value: &Value) -> GateResult<Option<KeyspaceId>> {
        if value.is_null() {
            return Ok(None);
        }
        match &self.kind {
            VindexKind::Hash => {
                let raw = value.as_u64().ok_or_else(|| {
                    GateError::vindex(format!(
                        "could not parse value: '{value}' for vindex {}",
                        self.name
                    ))
                })?;
                Ok(Some(KeyspaceId::from_u64(hash_u64(raw))))
            }
            VindexKind::UnicodeLooseHash => Ok(Some(KeyspaceId::from_u64(unicode_loose_hash(value)))),
            VindexKind::UnicodeLooseMd5 => Ok(Some(KeyspaceId::from_u64(unicode_loose_md5(value)))),
            VindexKind::Lookup(_) => Err(GateError::Internal(format!(
                "vindex {} is not functional",
                self.name
            ))),
        }
    }

    /// Inverse of a reversible vindex.
    pub fn reverse_map(&self, ksid: &KeyspaceId) -> Option<Value> {
        match self.kind {
            VindexKind::Hash => Some(Value::Int(unhash_u64(ksid.as_u64()) as i64)),
            _ => None,
        }
    }

    /// Keyspace id named by a lookup table's `to` value.
    pub fn ksid_from_stored(&self, stored: &Value) -> Option<KeyspaceId> {
        let params = self.lookup()?;
        if stored.is_null() {
            return None;
        }
        match params.store {
            LookupStore::KeyspaceId => KeyspaceId::from_bytes(&stored.to_bytes()),
            LookupStore::HashedInt => stored.as_u64().map(|raw| KeyspaceId::from_u64(hash_u64(raw))),
        }
    }

    /// Value written to a lookup table's `to` column for `ksid`.
    pub fn stored_value(&self, ksid: &KeyspaceId) -> Value {
        match self.lookup().map(|p| p.store) {
            Some(LookupStore::HashedInt) => Value::Int(unhash_u64(ksid.as_u64()) as i64),
            _ => Value::Bytes(ksid.as_bytes().to_vec()),
        }
    }
}

impl fmt::Display for Vindex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.keyspace, self.name, self.type_name())
    }
}

/// Triple DES under an all-zero key; every `hash` keyspace id is one
/// encrypted big-endian block.
fn null_key_cipher() -> &'static TdesEde3 {
    static CIPHER: OnceLock<TdesEde3> = OnceLock::new();
    CIPHER.get_or_init(|| TdesEde3::new(&GenericArray::from([0u8; 24])))
}

/// Keyspace id the `hash` vindex assigns to `raw`.
pub fn hash_u64(raw: u64) -> u64 {
    let mut block = GenericArray::from(raw.to_be_bytes());
    null_key_cipher().encrypt_block(&mut block);
    let mut out = [0u8; 8];
    out.copy_from_slice(&block);
    u64::from_be_bytes(out)
}

/// Inverse of `hash_u64`.
pub fn unhash_u64(hashed: u64) -> u64 {
    let mut block = GenericArray::from(hashed.to_be_bytes());
    null_key_cipher().decrypt_block(&mut block);
    let mut out = [0u8; 8];
    out.copy_from_slice(&block);
    u64::from_be_bytes(out)
}

fn loose_text(value: &Value) -> String {
    let text = match value {
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        other => other.to_string(),
    };
    text.trim_end_matches(' ').chars().flat_map(char::to_lowercase).collect()
}

/// Leading eight bytes of the MD5 digest of the loosely normalized text.
/// Shard ranges never look past the eighth byte, so placement matches the
/// full sixteen-byte digest.
pub fn unicode_loose_md5(value: &Value) -> u64 {
    let digest = Md5::digest(loose_text(value).as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Lowercased, right-trimmed text digested with xxHash64.
pub fn unicode_loose_hash(value: &Value) -> u64 {
    xxh64(loose_text(value).as_bytes(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn hash_is_reversible() {
        for raw in [0u64, 1, 2, 3, 4, 42, u64::MAX, 0x8000_0000_0000_0000] {
            assert_eq!(unhash_u64(hash_u64(raw)), raw);
        }
        assert_ne!(hash_u64(1), hash_u64(2));
        let vindex = Vindex::from_type("hash", "user", "hash", &BTreeMap::new(), None).expect("vindex");
        let ksid = vindex
            .map_functional(&Value::Int(7))
            .expect("map")
            .expect("non-null");
        assert_eq!(vindex.reverse_map(&ksid), Some(Value::Int(7)));
        assert_eq!(vindex.map_functional(&Value::Null).expect("map"), None);
        assert!(vindex.map_functional(&Value::text("abc")).is_err());
    }

    #[test]
    fn hash_places_ids_like_existing_deployments() {
        let cases = [
            (1u64, 0x166b_40b4_4aba_4bd6u64),
            (2, 0x06e7_ea22_ce92_708f),
            (3, 0x4eb1_90c9_a2fa_169c),
            (4, 0xd2fd_8867_d50d_2dfe),
            (5, 0x70bb_023c_810c_a87a),
        ];
        for (raw, hashed) in cases {
            assert_eq!(hash_u64(raw), hashed, "hash of {raw}");
        }
        let low: Vec<u64> = (1..=5).filter(|raw| hash_u64(*raw) < 1 << 63).collect();
        assert_eq!(low, vec![1, 2, 3, 5]);
    }

    #[test]
    fn unicode_loose_md5_is_a_digest_prefix() {
        // md5("test") = 098f6bcd4621d373cade4e832627b4f6
        assert_eq!(unicode_loose_md5(&Value::text("Test  ")), 0x098f_6bcd_4621_d373);
        let vindex = Vindex::from_type("name_md5", "user", "unicode_loose_md5", &BTreeMap::new(), None)
            .expect("vindex");
        assert_eq!(vindex.type_name(), "unicode_loose_md5");
        assert!(vindex.is_unique() && vindex.is_functional() && !vindex.is_reversible());
    }

    #[test]
    fn unicode_loose_hash_ignores_case_and_trailing_space() {
        assert_eq!(
            unicode_loose_hash(&Value::text("Apple ")),
            unicode_loose_hash(&Value::text("apple"))
        );
        assert_ne!(
            unicode_loose_hash(&Value::text("apple")),
            unicode_loose_hash(&Value::text("apples"))
        );
    }

    #[test]
    fn lookup_params_are_validated() {
        let mut params = BTreeMap::new();
        params.insert("table".to_string(), "lookup.name_map".to_string());
        params.insert("from".to_string(), "name".to_string());
        let err = Vindex::from_type("name_map", "user", "lookup_hash", &params, None)
            .expect_err("missing to");
        assert!(err.to_string().contains("missing lookup parameter to"));

        params.insert("to".to_string(), "user_id".to_string());
        let vindex = Vindex::from_type("name_map", "user", "lookup_hash", &params, Some("user".into()))
            .expect("vindex");
        assert!(!vindex.is_unique());
        assert!(vindex.is_owned());
        assert_eq!(vindex.cost(), 20);
        let ksid = KeyspaceId::from_u64(hash_u64(9));
        assert_eq!(vindex.stored_value(&ksid), Value::Int(9));
        assert_eq!(vindex.ksid_from_stored(&Value::Int(9)), Some(ksid));
        assert!(Vindex::from_type("x", "user", "md5", &params, None).is_err());
    }
}

//! Tree objects: the typed JSON-shaped value with variants DIR, DIRREF,
//! VAL, VALREF, SYMLINK (spec GLOSSARY, §4.5, §4.6).
//!
//! Ambiguity between "raw bytes" and "encoded tree object" in a cache entry
//! is resolved by trying to decode as a tree object and falling back to raw
//! (spec §9 "Dynamic dispatch replaced by tagged variants").

use std::collections::BTreeMap;

use serde_json::{json, Value};
use weft_base::{invalid, proto, Result};

use crate::blobref::Blobref;

/// A directory, value, or symlink node in the content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeObject {
    /// An inline directory: names to immediate child tree objects.
    Dir(BTreeMap<String, TreeObject>),
    /// A directory stored elsewhere in the cache, referenced by blobref.
    DirRef(Blobref),
    /// An inline value, stored as one or more content blobrefs whose
    /// concatenated bytes (in order) form the value (spec scenario 5:
    /// `APPEND` yields a two-element `VALREF`).
    Val(Vec<u8>),
    /// A value stored as one or more blobrefs elsewhere in the cache.
    ValRef(Vec<Blobref>),
    /// A textual path, resolved fresh on every walk; never an object
    /// reference (spec §9 "Cyclic data").
    Symlink(String),
}

impl TreeObject {
    /// Encodes this tree object as its JSON-shaped wire form.
    pub fn to_json(&self) -> Value {
        match self {
            TreeObject::Dir(entries) => {
                let mut obj = serde_json::Map::new();
                for (name, child) in entries {
                    obj.insert(name.clone(), child.to_json());
                }
                json!({"type": "DIR", "entries": Value::Object(obj)})
            }
            TreeObject::DirRef(r) => json!({"type": "DIRREF", "ref": r.as_str()}),
            TreeObject::Val(bytes) => json!({"type": "VAL", "data": hex::encode(bytes)}),
            TreeObject::ValRef(refs) => {
                json!({"type": "VALREF", "refs": refs.iter().map(Blobref::as_str).collect::<Vec<_>>()})
            }
            TreeObject::Symlink(path) => json!({"type": "SYMLINK", "path": path}),
        }
    }

    /// Attempts to parse `bytes` as a JSON-encoded tree object. Callers
    /// fall back to treating the bytes as a raw value on `Err`, per the
    /// spec's documented ambiguity resolution.
    pub fn try_decode(bytes: &[u8]) -> Result<TreeObject> {
        let v: Value = serde_json::from_slice(bytes).map_err(|e| proto(format!("not a tree object: {e}")))?;
        Self::from_json(&v)
    }

    pub fn from_json(v: &Value) -> Result<TreeObject> {
        let obj = v.as_object().ok_or_else(|| proto("tree object is not a JSON object"))?;
        let ty = obj.get("type").and_then(Value::as_str).ok_or_else(|| proto("tree object missing type"))?;
        match ty {
            "DIR" => {
                let entries = obj
                    .get("entries")
                    .and_then(Value::as_object)
                    .ok_or_else(|| proto("DIR tree object missing entries"))?;
                let mut map = BTreeMap::new();
                for (name, child) in entries {
                    map.insert(name.clone(), TreeObject::from_json(child)?);
                }
                Ok(TreeObject::Dir(map))
            }
            "DIRREF" => {
                let r = obj.get("ref").and_then(Value::as_str).ok_or_else(|| proto("DIRREF missing ref"))?;
                Ok(TreeObject::DirRef(Blobref::parse(r)?))
            }
            "VAL" => {
                let data = obj.get("data").and_then(Value::as_str).ok_or_else(|| proto("VAL missing data"))?;
                let bytes = hex::decode(data).map_err(|e| invalid(format!("VAL data not hex: {e}")))?;
                Ok(TreeObject::Val(bytes))
            }
            "VALREF" => {
                let refs = obj.get("refs").and_then(Value::as_array).ok_or_else(|| proto("VALREF missing refs"))?;
                let mut out = Vec::with_capacity(refs.len());
                for r in refs {
                    let r = r.as_str().ok_or_else(|| proto("VALREF entry not a string"))?;
                    out.push(Blobref::parse(r)?);
                }
                Ok(TreeObject::ValRef(out))
            }
            "SYMLINK" => {
                let path = obj.get("path").and_then(Value::as_str).ok_or_else(|| proto("SYMLINK missing path"))?;
                Ok(TreeObject::Symlink(path.to_string()))
            }
            other => Err(proto(format!("unknown tree object type {other:?}"))),
        }
    }

    pub fn is_dir_like(&self) -> bool {
        matches!(self, TreeObject::Dir(_) | TreeObject::DirRef(_))
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, TreeObject::Symlink(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn val_round_trips_through_json() {
        let obj = TreeObject::Val(b"hello".to_vec());
        let encoded = serde_json::to_vec(&obj.to_json()).unwrap();
        let decoded = TreeObject::try_decode(&encoded).unwrap();
        assert_eq!(obj, decoded);
    }

    #[test]
    fn dir_round_trips_with_nested_children() {
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), TreeObject::Val(b"x".to_vec()));
        entries.insert("b".to_string(), TreeObject::Symlink("../elsewhere".to_string()));
        let obj = TreeObject::Dir(entries);
        let encoded = serde_json::to_vec(&obj.to_json()).unwrap();
        let decoded = TreeObject::try_decode(&encoded).unwrap();
        assert_eq!(obj, decoded);
    }

    #[test]
    fn raw_bytes_that_are_not_json_fail_to_decode() {
        assert!(TreeObject::try_decode(b"not json at all").is_err());
    }

    #[test]
    fn valref_round_trips_two_blobrefs_in_order() {
        let a = Blobref::of(b"x");
        let b = Blobref::of(b"y");
        let obj = TreeObject::ValRef(vec![a.clone(), b.clone()]);
        let encoded = serde_json::to_vec(&obj.to_json()).unwrap();
        let TreeObject::ValRef(refs) = TreeObject::try_decode(&encoded).unwrap() else {
            panic!("expected VALREF");
        };
        assert_eq!(refs, vec![a, b]);
    }
}

//! Payload body: two views (raw bytes, JSON dictionary) over the same
//! underlying frame. See spec §4.4 "Payload body".

use serde_json::Value;
use weft_base::{invalid, proto, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    raw: Option<Vec<u8>>,
}

impl Payload {
    pub fn new() -> Self {
        Payload { raw: None }
    }

    pub fn from_raw(bytes: impl Into<Vec<u8>>) -> Self {
        Payload {
            raw: Some(bytes.into()),
        }
    }

    pub fn is_present(&self) -> bool {
        self.raw.is_some()
    }

    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    pub fn set_raw(&mut self, bytes: impl Into<Vec<u8>>) {
        self.raw = Some(bytes.into());
    }

    pub fn clear(&mut self) {
        self.raw = None;
    }

    /// Parses the raw payload as a JSON object. Fails with PROTO if the
    /// payload is absent or is not valid JSON, or with INVAL if it parses
    /// but is not an object (a dictionary).
    pub fn get_json(&self) -> Result<Value> {
        let raw = self
            .raw
            .as_deref()
            .ok_or_else(|| proto("no payload present"))?;
        let v: Value =
            serde_json::from_slice(raw).map_err(|e| proto(format!("invalid JSON payload: {e}")))?;
        if !v.is_object() {
            return Err(invalid("JSON payload is not a dictionary"));
        }
        Ok(v)
    }

    /// Stores `v` as the raw payload. Fails with INVAL if `v` is not a JSON
    /// object.
    pub fn set_json(&mut self, v: &Value) -> Result<()> {
        if !v.is_object() {
            return Err(invalid("only JSON objects may be stored as payload"));
        }
        self.raw = Some(serde_json::to_vec(v)?);
        Ok(())
    }

    /// Packs `fields` (name, value) pairs into a JSON object payload.
    pub fn pack(&mut self, fields: &[(&str, Value)]) -> Result<()> {
        let mut map = serde_json::Map::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), v.clone());
        }
        self.set_json(&Value::Object(map))
    }

    /// Unpacks named fields from the JSON object payload, in order. Returns a
    /// PROTO error naming the first missing field on mismatch.
    pub fn unpack(&self, names: &[&str]) -> Result<Vec<Value>> {
        let v = self.get_json()?;
        let obj = v.as_object().expect("get_json guarantees an object");
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match obj.get(*name) {
                Some(val) => out.push(val.clone()),
                None => return Err(proto(format!("payload missing field `{name}`"))),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let mut p = Payload::new();
        p.set_json(&json!({"a": 1, "b": "two"})).unwrap();
        let v = p.get_json().unwrap();
        assert_eq!(v["a"], 1);
        assert_eq!(v["b"], "two");
    }

    #[test]
    fn rejects_non_object_json() {
        let mut p = Payload::new();
        assert!(p.set_json(&json!([1, 2, 3])).is_err());
    }

    #[test]
    fn pack_unpack() {
        let mut p = Payload::new();
        p.pack(&[("x", json!(1)), ("y", json!(2))]).unwrap();
        let vals = p.unpack(&["y", "x"]).unwrap();
        assert_eq!(vals, vec![json!(2), json!(1)]);
    }

    #[test]
    fn unpack_missing_field_is_proto_error() {
        let mut p = Payload::new();
        p.pack(&[("x", json!(1))]).unwrap();
        let err = p.unpack(&["z"]).unwrap_err();
        assert_eq!(err.kind(), weft_base::ErrorKind::Proto);
    }
}

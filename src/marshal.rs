//! JSON marshalling with handle-sentinel substitution.
//!
//! Payloads on the wire are JSON. Two single-key sentinel objects escape the
//! JSON type system: `{"RUST_WORLD_INST_ID": n}` names a host object by its
//! registry handle, `{"PHP_WORLD_INST_ID": n}` names a PHP instance by its
//! PHP-side handle. Encoding registers handle-eligible values and never
//! mutates its input; decoding substitutes live host objects and never
//! registers anything.

use crate::registry::HandleRegistry;
use crate::value::Value;

use std::sync::Arc;

use crate::host::FnObject;

/// Sentinel key for host-built handle references.
pub const HANDLE_ID_KEY: &str = "RUST_WORLD_INST_ID";
/// Sentinel key for PHP-built instance references, preserved verbatim by the
/// host.
pub const INST_ID_KEY: &str = "PHP_WORLD_INST_ID";

/// Encode a value into wire JSON, registering handles for host objects and
/// functions.
pub fn encode(value: &Value, reg: &mut HandleRegistry) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Float(x) => serde_json::Value::from(*x),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Arr(items) => {
            serde_json::Value::Array(items.iter().map(|v| encode(v, reg)).collect())
        }
        Value::Map(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), encode(v, reg))).collect(),
        ),
        Value::Obj(obj) => sentinel(HANDLE_ID_KEY, reg.register(obj.clone())),
        Value::Fun(f) => sentinel(HANDLE_ID_KEY, reg.register(Arc::new(FnObject(f.clone())))),
        Value::PhpRef(id) => sentinel(INST_ID_KEY, *id),
    }
}

/// Encode a JSON array of call arguments, as text.
pub fn encode_args(args: &[Value], reg: &mut HandleRegistry) -> String {
    let items: Vec<serde_json::Value> = args.iter().map(|v| encode(v, reg)).collect();
    serde_json::Value::Array(items).to_string()
}

/// Decode wire JSON, substituting host objects for known handle sentinels.
///
/// An unknown host handle is left as the sentinel map so the payload is
/// preserved; PHP instance sentinels always become [`Value::PhpRef`].
pub fn decode(json: serde_json::Value, reg: &HandleRegistry) -> Value {
    match json {
        serde_json::Value::Object(map) => {
            if let Some(id) = sentinel_id(&map, HANDLE_ID_KEY) {
                if let Some(obj) = reg.lookup(id) {
                    return Value::Obj(obj);
                }
                return Value::Map(
                    map.into_iter().map(|(k, v)| (k, decode(v, reg))).collect(),
                );
            }
            if let Some(id) = sentinel_id(&map, INST_ID_KEY) {
                return Value::PhpRef(id);
            }
            Value::Map(map.into_iter().map(|(k, v)| (k, decode(v, reg))).collect())
        }
        serde_json::Value::Array(items) => {
            Value::Arr(items.into_iter().map(|v| decode(v, reg)).collect())
        }
        other => Value::from(other),
    }
}

/// Plain-JSON projection of a value; `None` when it contains host objects,
/// functions, or PHP references that cannot be represented without a
/// registry.
pub fn to_plain_json(value: &Value) -> Option<serde_json::Value> {
    Some(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Float(x) => serde_json::Value::from(*x),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Arr(items) => serde_json::Value::Array(
            items.iter().map(to_plain_json).collect::<Option<_>>()?,
        ),
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| Some((k.clone(), to_plain_json(v)?)))
                .collect::<Option<_>>()?,
        ),
        Value::Obj(_) | Value::Fun(_) | Value::PhpRef(_) => return None,
    })
}

fn sentinel(key: &str, id: u32) -> serde_json::Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(key.to_string(), serde_json::Value::from(id));
    serde_json::Value::Object(map)
}

fn sentinel_id(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<u32> {
    if map.len() != 1 {
        return None;
    }
    let id = map.get(key)?.as_i64()?;
    u32::try_from(id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostFn, PropertyBag};
    use serde_json::json;

    #[test]
    fn test_round_trip_plain() {
        let mut reg = HandleRegistry::new();
        let v = Value::from(json!({"a": {"b": [1, "x", null, 2.5]}}));
        let encoded = encode(&v, &mut reg);
        assert_eq!(encoded, json!({"a": {"b": [1, "x", null, 2.5]}}));
        let decoded = decode(encoded, &reg);
        assert_eq!(decoded, v);
        assert_eq!(reg.len(), 0, "plain payloads register nothing");
    }

    #[test]
    fn test_encode_registers_objects() {
        let mut reg = HandleRegistry::new();
        let obj: std::sync::Arc<dyn crate::host::HostObject> =
            std::sync::Arc::new(PropertyBag::new());
        let encoded = encode(&Value::Obj(obj.clone()), &mut reg);
        assert_eq!(encoded, json!({ HANDLE_ID_KEY: 2 }));
        assert_eq!(reg.len(), 1);

        // Decoding the sentinel yields the same live object.
        match decode(encoded, &reg) {
            Value::Obj(got) => assert!(std::sync::Arc::ptr_eq(&got, &obj)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_registers_functions() {
        let mut reg = HandleRegistry::new();
        let f = HostFn::from_sync(|_| Ok(Value::Null));
        let encoded = encode(&Value::Fun(f), &mut reg);
        assert_eq!(encoded, json!({ HANDLE_ID_KEY: 2 }));
    }

    #[test]
    fn test_php_ref_preserved_verbatim() {
        let mut reg = HandleRegistry::new();
        let encoded = encode(&Value::PhpRef(42), &mut reg);
        assert_eq!(encoded, json!({ INST_ID_KEY: 42 }));
        assert_eq!(reg.len(), 0);
        assert_eq!(decode(encoded, &reg), Value::PhpRef(42));
    }

    #[test]
    fn test_unknown_handle_left_as_sentinel() {
        let reg = HandleRegistry::new();
        let decoded = decode(json!({ HANDLE_ID_KEY: 1234 }), &reg);
        assert_eq!(
            decoded,
            Value::from(json!({ HANDLE_ID_KEY: 1234 })),
            "unknown handles survive as plain maps"
        );
    }

    #[test]
    fn test_two_key_map_is_not_a_sentinel() {
        let reg = HandleRegistry::new();
        let decoded = decode(json!({ HANDLE_ID_KEY: 2, "other": 1 }), &reg);
        assert!(matches!(decoded, Value::Map(_)));
    }

    #[test]
    fn test_negative_id_is_not_a_sentinel() {
        let reg = HandleRegistry::new();
        assert!(matches!(decode(json!({ HANDLE_ID_KEY: -1 }), &reg), Value::Map(_)));
    }

    #[test]
    fn test_encode_args() {
        let mut reg = HandleRegistry::new();
        let s = encode_args(&[Value::from("x"), Value::from(1)], &mut reg);
        assert_eq!(s, "[\"x\",1]");
    }

    #[test]
    fn test_to_plain_json() {
        assert_eq!(to_plain_json(&Value::from(json!([1, {"a": "b"}]))), Some(json!([1, {"a": "b"}])));
        assert_eq!(to_plain_json(&Value::PhpRef(1)), None);
    }
}

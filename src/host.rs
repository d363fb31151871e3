// Host boundary: mapping between host values and FEEL values, and the
// bridge used by host-function bodies. This is the only impure seam of the
// interpreter; everything behind it stays deterministic.

use std::rc::Rc;

use indexmap::IndexMap;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::evaluator::Context;
use crate::value::Val;

/// Conversion between host-native values and FEEL values.
///
/// Only the host-function bridge consumes this; the evaluator core never
/// looks at host values. The host representation is JSON, which is what the
/// surrounding harnesses speak.
pub trait ValueMapper {
    fn to_val(&self, value: &JsonValue) -> Val;
    fn unpack_val(&self, value: &Val) -> JsonValue;
}

/// The default [`ValueMapper`]: JSON objects become contexts, arrays become
/// lists, numbers become decimals. Temporal values unpack to their ISO
/// literal strings; functions and errors unpack to null.
pub struct JsonValueMapper;

impl ValueMapper for JsonValueMapper {
    fn to_val(&self, value: &JsonValue) -> Val {
        match value {
            JsonValue::Null => Val::Null,
            JsonValue::Bool(b) => Val::Boolean(*b),
            JsonValue::Number(n) => {
                let converted = if let Some(i) = n.as_i64() {
                    Some(Decimal::from(i))
                } else if let Some(u) = n.as_u64() {
                    Decimal::from_u64(u)
                } else {
                    n.as_f64().and_then(Decimal::from_f64)
                };
                match converted {
                    Some(d) => Val::Number(d),
                    None => Val::Error(format!("can not map number '{}'", n)),
                }
            }
            JsonValue::String(s) => Val::String(s.clone()),
            JsonValue::Array(items) => Val::List(items.iter().map(|v| self.to_val(v)).collect()),
            JsonValue::Object(entries) => {
                let mut ctx = Context::new();
                for (key, value) in entries {
                    ctx.set_variable(key.clone(), self.to_val(value));
                }
                Val::Context(ctx)
            }
        }
    }

    fn unpack_val(&self, value: &Val) -> JsonValue {
        match value {
            Val::Number(n) => {
                if n.is_integer() {
                    match n.to_i64() {
                        Some(i) => JsonValue::from(i),
                        None => JsonValue::from(n.to_f64().unwrap_or(0.0)),
                    }
                } else {
                    JsonValue::from(n.to_f64().unwrap_or(0.0))
                }
            }
            Val::Boolean(b) => JsonValue::Bool(*b),
            Val::String(s) => JsonValue::String(s.clone()),
            Val::Date(_)
            | Val::LocalTime(_)
            | Val::Time(_)
            | Val::LocalDateTime(_)
            | Val::DateTime(_)
            | Val::YearMonthDuration(_)
            | Val::DayTimeDuration(_) => JsonValue::String(value.to_string()),
            Val::Null => JsonValue::Null,
            Val::List(items) => {
                JsonValue::Array(items.iter().map(|v| self.unpack_val(v)).collect())
            }
            Val::Context(ctx) => {
                let mut map = serde_json::Map::new();
                for (key, value) in ctx.flat_variables() {
                    map.insert(key, self.unpack_val(&value));
                }
                JsonValue::Object(map)
            }
            Val::Function(_) | Val::Error(_) => JsonValue::Null,
        }
    }
}

/// Host bridge errors
#[derive(Error, Debug)]
pub enum HostError {
    #[error("fail to load class '{0}'")]
    ClassNotFound(String),

    #[error("no method found with name '{method}({})' in class '{class}'", .arg_types.join(", "))]
    MethodNotFound {
        class: String,
        method: String,
        arg_types: Vec<String>,
    },

    #[error("fail to invoke method '{method}' of class '{class}': {message}")]
    Invocation {
        class: String,
        method: String,
        message: String,
    },
}

/// Resolution and invocation of host functions.
///
/// The evaluator unpacks FEEL arguments through the [`ValueMapper`], calls
/// `invoke`, and packs the result back. Implementations resolve the class
/// and method however the platform allows; [`StaticHostBridge`] is a plain
/// registry for embedders (and tests) without a reflective runtime.
pub trait HostBridge {
    fn invoke(
        &self,
        class: &str,
        method: &str,
        arg_types: &[String],
        args: &[JsonValue],
    ) -> Result<JsonValue, HostError>;
}

pub type HostFn = Rc<dyn Fn(&[JsonValue]) -> Result<JsonValue, String>>;

/// A registry-backed [`HostBridge`]. Methods are keyed by class name, method
/// name, and the declared argument type names. An empty registry rejects
/// every class, which is also the evaluator's default.
#[derive(Default)]
pub struct StaticHostBridge {
    classes: IndexMap<String, IndexMap<(String, Vec<String>), HostFn>>,
}

impl StaticHostBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        class: impl Into<String>,
        method: impl Into<String>,
        arg_types: &[&str],
        f: impl Fn(&[JsonValue]) -> Result<JsonValue, String> + 'static,
    ) {
        self.classes.entry(class.into()).or_default().insert(
            (
                method.into(),
                arg_types.iter().map(|t| t.to_string()).collect(),
            ),
            Rc::new(f),
        );
    }
}

impl HostBridge for StaticHostBridge {
    fn invoke(
        &self,
        class: &str,
        method: &str,
        arg_types: &[String],
        args: &[JsonValue],
    ) -> Result<JsonValue, HostError> {
        let methods = self
            .classes
            .get(class)
            .ok_or_else(|| HostError::ClassNotFound(class.to_string()))?;
        let key = (method.to_string(), arg_types.to_vec());
        let f = methods.get(&key).ok_or_else(|| HostError::MethodNotFound {
            class: class.to_string(),
            method: method.to_string(),
            arg_types: arg_types.to_vec(),
        })?;
        f(args).map_err(|message| HostError::Invocation {
            class: class.to_string(),
            method: method.to_string(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_mapper_roundtrip() {
        let mapper = JsonValueMapper;
        let json = json!({"name": "order", "total": 12.5, "lines": [1, 2], "open": true});
        let val = mapper.to_val(&json);

        let ctx = val.as_context().expect("expected context");
        assert_eq!(ctx.variable("name"), Some(&Val::from("order")));
        assert_eq!(
            ctx.variable("lines"),
            Some(&Val::List(vec![Val::from(1), Val::from(2)]))
        );

        assert_eq!(mapper.unpack_val(&val), json);
    }

    #[test]
    fn test_unpack_temporal_as_iso_string() {
        let mapper = JsonValueMapper;
        let date = Val::Date(crate::datetime::parse_date("2021-03-04").unwrap());
        assert_eq!(mapper.unpack_val(&date), json!("2021-03-04"));
    }

    #[test]
    fn test_static_bridge_resolution() {
        let mut bridge = StaticHostBridge::new();
        bridge.register("java.lang.Math", "abs", &["double"], |args| {
            let n = args[0].as_f64().ok_or("expected a number")?;
            Ok(json!(n.abs()))
        });

        let args = [json!(-3.0)];
        let result = bridge
            .invoke("java.lang.Math", "abs", &["double".to_string()], &args)
            .unwrap();
        assert_eq!(result, json!(3.0));

        let missing_class = bridge.invoke("java.lang.Nope", "abs", &[], &[]);
        assert!(matches!(missing_class, Err(HostError::ClassNotFound(_))));

        let missing_method =
            bridge.invoke("java.lang.Math", "abs", &["long".to_string()], &args);
        assert!(matches!(
            missing_method,
            Err(HostError::MethodNotFound { .. })
        ));
    }
}

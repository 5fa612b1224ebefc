//! Dynamically typed values flowing through templates.
//!
//! Parameters, variables, and expression results are all [`Value`]s. The
//! semantics follow the small JavaScript subset documents are written
//! against: loose truthiness, string coercion for interpolation, and
//! caller-supplied async callables.

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Ordered object storage.
pub type ObjectMap = IndexMap<String, Value>;

type CallableFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync;

/// A caller-supplied function that documents can invoke.
///
/// Callables are async: the evaluator awaits each call before continuing
/// the walk. A failing callable reports its error as a plain string.
#[derive(Clone)]
pub struct Callable(Arc<CallableFn>);

impl Callable {
    /// Wrap an async function.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self(Arc::new(move |args| func(args).boxed()))
    }

    /// Wrap a synchronous function.
    pub fn sync<F>(func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self(Arc::new(move |args| futures::future::ready(func(args)).boxed()))
    }

    /// Invoke the callable.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, String> {
        (self.0)(args).await
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[Function]")
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A template value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value; renders as nothing
    #[default]
    Undefined,
    /// Explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// IEEE double, as in JavaScript
    Number(f64),
    /// UTF-8 string
    String(String),
    /// Ordered list
    Array(Vec<Value>),
    /// Insertion-ordered object
    Object(ObjectMap),
    /// Point in time (produced by `$now`)
    Date(DateTime<Utc>),
    /// Caller-supplied function
    Function(Callable),
}

impl Value {
    /// Build an object value from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Whether the value is `undefined`.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Whether the value is `null` or `undefined`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// JavaScript truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Date(_) | Value::Function(_) => true,
        }
    }

    /// Result of the `typeof` operator.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Array(_) | Value::Object(_) | Value::Date(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
        }
    }

    /// Borrow the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the object payload, if any.
    pub fn as_object(&self) -> Option<&ObjectMap> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Number coercion (`ToNumber`).
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::String(s) => parse_number(s),
            Value::Array(items) => match items.as_slice() {
                [] => 0.0,
                [single] => parse_number(&single.to_js_string()),
                _ => f64::NAN,
            },
            Value::Date(date) => date.timestamp_millis() as f64,
            Value::Object(_) | Value::Function(_) => f64::NAN,
        }
    }

    /// String coercion (`ToString`), as used by `+` and `join`.
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    if item.is_nullish() {
                        String::new()
                    } else {
                        item.to_js_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".to_string(),
            Value::Date(date) => format_date(date),
            Value::Function(_) => "[Function]".to_string(),
        }
    }

    /// Text emitted when the value is interpolated into a template.
    ///
    /// Objects, arrays, dates, and `null` are JSON encoded; everything else
    /// uses string coercion.
    pub fn to_template_string(&self) -> String {
        match self {
            Value::Null | Value::Array(_) | Value::Object(_) | Value::Date(_) => {
                serde_json::to_string(&self.to_json()).unwrap_or_default()
            }
            other => other.to_js_string(),
        }
    }

    /// Strict equality (`===`). Arrays and objects compare structurally.
    pub fn strict_equals(&self, other: &Value) -> bool {
        self == other
    }

    /// Loose equality (`==`).
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::String(_))
            | (Value::String(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => self.to_number() == other.to_number(),
            (Value::Array(_) | Value::Object(_) | Value::Date(_), Value::String(_))
            | (Value::String(_), Value::Array(_) | Value::Object(_) | Value::Date(_)) => {
                self.to_js_string() == other.to_js_string()
            }
            (Value::Array(_) | Value::Object(_), Value::Number(_))
            | (Value::Number(_), Value::Array(_) | Value::Object(_)) => {
                self.to_number() == other.to_number()
            }
            _ => self.strict_equals(other),
        }
    }

    /// Convert to plain JSON. Functions and `undefined` become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null | Value::Function(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Value::Date(date) => serde_json::Value::String(format_date(date)),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Render a date the way `Date.prototype.toISOString` does.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Render a number the way JavaScript's `String(n)` does for common values.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.abs() >= 1e21 || n.abs() < 1e-6 {
        let exponential = format!("{:e}", n);
        match exponential.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{}e+{}", mantissa, exponent)
            }
            _ => exponential,
        }
    } else {
        n.to_string()
    }
}

fn parse_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => {
            if let Some(hex) = trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
            {
                return i64::from_str_radix(hex, 16)
                    .map(|v| v as f64)
                    .unwrap_or(f64::NAN);
            }
            if trimmed.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
                return f64::NAN;
            }
            trimmed.parse::<f64>().unwrap_or(f64::NAN)
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Callable> for Value {
    fn from(callable: Callable) -> Self {
        Value::Function(callable)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

/// Serde adapter for engine state that must restore exactly.
///
/// Plain [`Value`] serialization follows JSON and turns `undefined` into
/// `null`. Stashes and memoized results go through this module instead, which
/// writes `undefined` as a tagged marker so a restored binding still renders
/// as nothing. Use it with `#[serde(with = "crate::value::persisted")]`.
pub mod persisted {
    use super::Value;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const TYPE_KEY: &str = "__promptlType";
    const UNDEFINED_MARKER: &str = "undefined";

    /// State that can be written to and read back from tagged JSON.
    pub trait Persist: Sized {
        /// Encode as JSON, tagging `undefined`.
        fn to_persisted(&self) -> serde_json::Value;
        /// Decode JSON produced by [`Persist::to_persisted`].
        fn from_persisted(json: serde_json::Value) -> Result<Self, String>;
    }

    impl Persist for Value {
        fn to_persisted(&self) -> serde_json::Value {
            match self {
                Value::Undefined => {
                    let mut marker = serde_json::Map::new();
                    marker.insert(TYPE_KEY.to_string(), UNDEFINED_MARKER.into());
                    serde_json::Value::Object(marker)
                }
                Value::Array(items) => {
                    serde_json::Value::Array(items.iter().map(Value::to_persisted).collect())
                }
                Value::Object(map) => serde_json::Value::Object(
                    map.iter()
                        .map(|(key, value)| (key.clone(), value.to_persisted()))
                        .collect(),
                ),
                other => other.to_json(),
            }
        }

        fn from_persisted(json: serde_json::Value) -> Result<Self, String> {
            Ok(match json {
                serde_json::Value::Object(map)
                    if map.len() == 1
                        && map.get(TYPE_KEY).and_then(serde_json::Value::as_str)
                            == Some(UNDEFINED_MARKER) =>
                {
                    Value::Undefined
                }
                serde_json::Value::Object(map) => Value::Object(
                    map.into_iter()
                        .map(|(key, value)| Ok((key, Value::from_persisted(value)?)))
                        .collect::<Result<_, String>>()?,
                ),
                serde_json::Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(Value::from_persisted)
                        .collect::<Result<_, String>>()?,
                ),
                other => Value::from(other),
            })
        }
    }

    impl<T: Persist> Persist for Vec<T> {
        fn to_persisted(&self) -> serde_json::Value {
            serde_json::Value::Array(self.iter().map(T::to_persisted).collect())
        }

        fn from_persisted(json: serde_json::Value) -> Result<Self, String> {
            match json {
                serde_json::Value::Array(items) => items.into_iter().map(T::from_persisted).collect(),
                other => Err(format!("expected an array, got {}", other)),
            }
        }
    }

    // Absent options are skipped by the callers, so a present value is always `Some`.
    impl<T: Persist> Persist for Option<T> {
        fn to_persisted(&self) -> serde_json::Value {
            self.as_ref()
                .map(T::to_persisted)
                .unwrap_or(serde_json::Value::Null)
        }

        fn from_persisted(json: serde_json::Value) -> Result<Self, String> {
            T::from_persisted(json).map(Some)
        }
    }

    /// Serialize through [`Persist`].
    pub fn serialize<T: Persist, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        value.to_persisted().serialize(serializer)
    }

    /// Deserialize through [`Persist`].
    pub fn deserialize<'de, T: Persist, D: Deserializer<'de>>(deserializer: D) -> Result<T, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        T::from_persisted(json).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn numbers_render_like_javascript() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e22), "1.5e+22");
        assert_eq!(format_number(1e-7), "1e-7");
        assert_eq!(format_number(-2.5e-8), "-2.5e-8");
        assert_eq!(format_number(123456789012345680000.0), "123456789012345680000");
        assert_eq!(format_number(0.000001), "0.000001");
    }

    #[test]
    fn interpolation_encodes_structures_as_json() {
        let value = Value::from(json!([1, 2, 3, "bar", 5, 6]));
        assert_eq!(value.to_template_string(), "[1,2,3,\"bar\",5,6]");

        let object = Value::object([("a", Value::from(1i64))]);
        assert_eq!(object.to_template_string(), "{\"a\":1}");

        let date = Value::Date(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        assert_eq!(date.to_template_string(), "\"2024-01-02T03:04:05.000Z\"");
    }

    #[test]
    fn loose_equality_coerces() {
        assert!(Value::from("1").loose_equals(&Value::from(1i64)));
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(!Value::Null.strict_equals(&Value::Undefined));
        assert!(Value::Bool(true).loose_equals(&Value::from(1i64)));
        assert!(!Value::from("a").loose_equals(&Value::from(0i64)));
    }

    #[test]
    fn string_coercion_parses_numbers() {
        assert_eq!(Value::from(" 42 ").to_number(), 42.0);
        assert_eq!(Value::from("").to_number(), 0.0);
        assert!(Value::from("abc").to_number().is_nan());
        assert_eq!(Value::from("0x10").to_number(), 16.0);
    }

    #[test]
    fn functions_serialize_as_null() {
        let func = Value::Function(Callable::sync(|_| Ok(Value::Null)));
        assert_eq!(serde_json::to_value(&func).unwrap(), json!(null));
        assert_eq!(serde_json::to_value(Value::from(2.0)).unwrap(), json!(2));
        assert_eq!(serde_json::to_value(Value::from(2.5)).unwrap(), json!(2.5));
    }

    #[tokio::test]
    async fn callables_are_awaited() {
        let double = Callable::new(|args: Vec<Value>| async move {
            Ok(Value::Number(args[0].to_number() * 2.0))
        });
        assert_eq!(double.call(vec![Value::from(4i64)]).await, Ok(Value::Number(8.0)));
    }
}

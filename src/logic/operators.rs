//! Operator and builtin member semantics.

use crate::parser::ast::{BinaryOp, UnaryOp};
use crate::value::{Callable, Value, format_date, format_number};

/// Apply a unary operator.
pub fn unary(op: UnaryOp, value: Value) -> Value {
    match op {
        UnaryOp::Not => Value::Bool(!value.is_truthy()),
        UnaryOp::Minus => Value::Number(-value.to_number()),
        UnaryOp::Plus => Value::Number(value.to_number()),
        UnaryOp::BitNot => Value::Number(f64::from(!to_int32(value.to_number()))),
        UnaryOp::TypeOf => Value::String(value.type_of().to_string()),
        UnaryOp::Void => Value::Undefined,
    }
}

/// Apply a binary operator.
pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub => Value::Number(left.to_number() - right.to_number()),
        BinaryOp::Mul => Value::Number(left.to_number() * right.to_number()),
        BinaryOp::Div => Value::Number(left.to_number() / right.to_number()),
        BinaryOp::Rem => Value::Number(left.to_number() % right.to_number()),
        BinaryOp::Pow => Value::Number(left.to_number().powf(right.to_number())),
        BinaryOp::LooseEq => Value::Bool(left.loose_equals(right)),
        BinaryOp::LooseNe => Value::Bool(!left.loose_equals(right)),
        BinaryOp::StrictEq => Value::Bool(left.strict_equals(right)),
        BinaryOp::StrictNe => Value::Bool(!left.strict_equals(right)),
        BinaryOp::Lt => compare(left, right, |o| o.is_lt()),
        BinaryOp::Le => compare(left, right, |o| o.is_le()),
        BinaryOp::Gt => compare(left, right, |o| o.is_gt()),
        BinaryOp::Ge => compare(left, right, |o| o.is_ge()),
        BinaryOp::BitAnd => int_op(left, right, |a, b| a & b),
        BinaryOp::BitOr => int_op(left, right, |a, b| a | b),
        BinaryOp::BitXor => int_op(left, right, |a, b| a ^ b),
        BinaryOp::Shl => int_op(left, right, |a, b| a.wrapping_shl(b as u32 & 31)),
        BinaryOp::Shr => int_op(left, right, |a, b| a.wrapping_shr(b as u32 & 31)),
        BinaryOp::UShr => {
            let shift = to_int32(right.to_number()) as u32 & 31;
            let value = to_int32(left.to_number()) as u32;
            Value::Number(f64::from(value >> shift))
        }
        BinaryOp::In => Value::Bool(has_property(right, &left.to_js_string())),
    }
}

fn is_primitive_string_like(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Array(_) | Value::Object(_) | Value::Date(_) | Value::Function(_)
    )
}

fn add(left: &Value, right: &Value) -> Value {
    if is_primitive_string_like(left) || is_primitive_string_like(right) {
        let mut text = left.to_js_string();
        text.push_str(&right.to_js_string());
        Value::String(text)
    } else {
        Value::Number(left.to_number() + right.to_number())
    }
}

fn compare(left: &Value, right: &Value, test: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Value::Bool(test(a.cmp(b)));
    }
    let (a, b) = (left.to_number(), right.to_number());
    match a.partial_cmp(&b) {
        Some(ordering) => Value::Bool(test(ordering)),
        None => Value::Bool(false),
    }
}

fn int_op(left: &Value, right: &Value, op: impl Fn(i32, i32) -> i32) -> Value {
    let result = op(to_int32(left.to_number()), to_int32(right.to_number()));
    Value::Number(f64::from(result))
}

/// `ToInt32` conversion used by bitwise operators.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4_294_967_296.0);
    wrapped as u32 as i32
}

fn has_property(object: &Value, key: &str) -> bool {
    match object {
        Value::Object(map) => map.contains_key(key),
        Value::Array(items) => {
            key == "length" || key.parse::<usize>().is_ok_and(|index| index < items.len())
        }
        _ => false,
    }
}

/// Read `key` from `object`, including builtin members.
///
/// Returns `None` when the object cannot hold properties (`null` or
/// `undefined`).
pub fn get_property(object: &Value, key: &Value) -> Option<Value> {
    let name = match key {
        Value::Number(n) => format_number(*n),
        other => other.to_js_string(),
    };
    let value = match object {
        Value::Undefined | Value::Null => return None,
        Value::Object(map) => map.get(&name).cloned().unwrap_or_default(),
        Value::Array(items) => array_member(items, &name),
        Value::String(text) => string_member(text, &name),
        Value::Date(date) => match name.as_str() {
            "getTime" => {
                let millis = date.timestamp_millis() as f64;
                method(move |_| Ok(Value::Number(millis)))
            }
            "toISOString" => {
                let text = format_date(date);
                method(move |_| Ok(Value::String(text.clone())))
            }
            _ => Value::Undefined,
        },
        Value::Number(n) => match name.as_str() {
            "toString" => {
                let text = format_number(*n);
                method(move |_| Ok(Value::String(text.clone())))
            }
            "toFixed" => {
                let n = *n;
                method(move |args| {
                    let digits = args.first().map(Value::to_number).unwrap_or(0.0);
                    let digits = digits.clamp(0.0, 100.0) as usize;
                    Ok(Value::String(format!("{:.*}", digits, n)))
                })
            }
            _ => Value::Undefined,
        },
        Value::Bool(_) | Value::Function(_) => Value::Undefined,
    };
    Some(value)
}

fn method<F>(func: F) -> Value
where
    F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
{
    Value::Function(Callable::sync(func))
}

fn array_member(items: &[Value], name: &str) -> Value {
    if let Ok(index) = name.parse::<usize>() {
        return items.get(index).cloned().unwrap_or_default();
    }
    match name {
        "length" => Value::Number(items.len() as f64),
        "join" => {
            let items = items.to_vec();
            method(move |args| {
                let separator = match args.first() {
                    None | Some(Value::Undefined) => ",".to_string(),
                    Some(sep) => sep.to_js_string(),
                };
                Ok(Value::String(
                    items
                        .iter()
                        .map(|item| {
                            if item.is_nullish() {
                                String::new()
                            } else {
                                item.to_js_string()
                            }
                        })
                        .collect::<Vec<_>>()
                        .join(&separator),
                ))
            })
        }
        "includes" => {
            let items = items.to_vec();
            method(move |args| {
                let needle = args.first().cloned().unwrap_or_default();
                Ok(Value::Bool(items.iter().any(|item| item.strict_equals(&needle))))
            })
        }
        "indexOf" => {
            let items = items.to_vec();
            method(move |args| {
                let needle = args.first().cloned().unwrap_or_default();
                let index = items
                    .iter()
                    .position(|item| item.strict_equals(&needle))
                    .map(|i| i as f64)
                    .unwrap_or(-1.0);
                Ok(Value::Number(index))
            })
        }
        _ => Value::Undefined,
    }
}

fn string_member(text: &str, name: &str) -> Value {
    if let Ok(index) = name.parse::<usize>() {
        return text
            .chars()
            .nth(index)
            .map(|ch| Value::String(ch.to_string()))
            .unwrap_or_default();
    }
    let owned = text.to_string();
    match name {
        "length" => Value::Number(text.chars().count() as f64),
        "toUpperCase" => method(move |_| Ok(Value::String(owned.to_uppercase()))),
        "toLowerCase" => method(move |_| Ok(Value::String(owned.to_lowercase()))),
        "trim" => method(move |_| Ok(Value::String(owned.trim().to_string()))),
        "includes" => method(move |args| {
            let needle = args.first().map(Value::to_js_string).unwrap_or_default();
            Ok(Value::Bool(owned.contains(&needle)))
        }),
        "startsWith" => method(move |args| {
            let needle = args.first().map(Value::to_js_string).unwrap_or_default();
            Ok(Value::Bool(owned.starts_with(&needle)))
        }),
        "split" => method(move |args| {
            let parts = match args.first() {
                None | Some(Value::Undefined) => vec![Value::String(owned.clone())],
                Some(separator) => {
                    let separator = separator.to_js_string();
                    if separator.is_empty() {
                        owned.chars().map(|ch| Value::String(ch.to_string())).collect()
                    } else {
                        owned
                            .split(separator.as_str())
                            .map(|part| Value::String(part.to_string()))
                            .collect()
                    }
                }
            };
            Ok(Value::Array(parts))
        }),
        _ => Value::Undefined,
    }
}

/// Whether `object` already has `key` as an own, assignable property.
pub fn has_own_property(object: &Value, key: &Value) -> bool {
    match (object, key) {
        (Value::Object(map), key) => map.contains_key(&key.to_js_string()),
        (Value::Array(items), Value::Number(n)) => n.fract() == 0.0 && *n >= 0.0 && (*n as usize) < items.len(),
        (Value::Array(items), Value::String(s)) => {
            s.parse::<usize>().is_ok_and(|index| index < items.len())
        }
        _ => false,
    }
}

/// Write `key` on a container that already has it. Returns `false` when
/// the property does not exist.
pub fn set_own_property(object: &mut Value, key: &Value, value: Value) -> bool {
    let slot = match object {
        Value::Object(map) => map.get_mut(&key.to_js_string()),
        Value::Array(items) => match key.to_js_string().parse::<usize>() {
            Ok(index) => items.get_mut(index),
            Err(_) => None,
        },
        _ => None,
    };
    match slot {
        Some(slot) => {
            *slot = value;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: f64) -> Value {
        Value::Number(v)
    }

    #[test]
    fn addition_concatenates_strings() {
        assert_eq!(binary(BinaryOp::Add, &n(1.0), &n(2.0)), n(3.0));
        assert_eq!(
            binary(BinaryOp::Add, &Value::from("a"), &n(1.0)),
            Value::from("a1")
        );
        assert_eq!(
            binary(BinaryOp::Add, &Value::Array(vec![n(1.0), n(2.0)]), &Value::from("")),
            Value::from("1,2")
        );
    }

    #[test]
    fn bitwise_uses_int32() {
        assert_eq!(binary(BinaryOp::BitOr, &n(5.5), &n(2.0)), n(7.0));
        assert_eq!(binary(BinaryOp::Shl, &n(1.0), &n(33.0)), n(2.0));
        assert_eq!(binary(BinaryOp::UShr, &n(-1.0), &n(28.0)), n(15.0));
        assert_eq!(unary(UnaryOp::BitNot, n(0.0)), n(-1.0));
        assert_eq!(to_int32(4_294_967_297.0), 1);
    }

    #[test]
    fn comparisons_handle_strings_and_nan() {
        assert_eq!(
            binary(BinaryOp::Lt, &Value::from("a"), &Value::from("b")),
            Value::Bool(true)
        );
        assert_eq!(binary(BinaryOp::Ge, &n(f64::NAN), &n(1.0)), Value::Bool(false));
    }

    #[test]
    fn builtin_members() {
        let text = Value::from("Hello");
        assert_eq!(get_property(&text, &Value::from("length")), Some(n(5.0)));
        assert!(get_property(&Value::Null, &Value::from("x")).is_none());

        let array = Value::Array(vec![n(1.0), n(2.0)]);
        assert_eq!(get_property(&array, &n(1.0)), Some(n(2.0)));
        assert_eq!(get_property(&array, &n(5.0)), Some(Value::Undefined));
    }

    #[test]
    fn set_requires_existing_property() {
        let mut object = Value::object([("a", n(1.0))]);
        assert!(set_own_property(&mut object, &Value::from("a"), n(2.0)));
        assert!(!set_own_property(&mut object, &Value::from("b"), n(2.0)));
        assert_eq!(object, Value::object([("a", n(2.0))]));
    }
}

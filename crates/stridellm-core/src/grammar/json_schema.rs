//! JSON schema to pattern translation
//!
//! Produces compact JSON (no insignificant whitespace). Object properties are
//! emitted in the key order of the schema's `properties` map; properties not
//! listed in `required` may be omitted, other keys are never produced.
//! An unconstrained schema (`{}` or `true`) admits any scalar JSON value.

use super::regex::escape;
use crate::error::{Error, Result};
use serde_json::{Map, Value};

const MAX_DEPTH: usize = 32;

const STRING_CHAR: &str = r#"(?:[^"\\\x00-\x1F]|\\["\\/bfnrt]|\\u[0-9a-fA-F]{4})"#;
const INTEGER: &str = r"-?(?:0|[1-9]\d*)";
const NUMBER: &str = r"-?(?:0|[1-9]\d*)(?:\.\d+)?(?:[eE][+\-]?\d+)?";
const BOOLEAN: &str = "(?:true|false)";
const NULL: &str = "null";

/// Translate a schema into an equivalent pattern
pub fn schema_to_pattern(schema: &Value) -> Result<String> {
    translate(schema, 0)
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidGrammar(format!("json schema: {}", msg.into()))
}

fn any_scalar() -> String {
    format!("(?:\"{STRING_CHAR}*\"|{NUMBER}|{BOOLEAN}|{NULL})")
}

fn literal(value: &Value) -> Result<String> {
    Ok(escape(&serde_json::to_string(value)?))
}

fn alternatives(options: Vec<String>) -> String {
    format!("(?:{})", options.join("|"))
}

fn translate(schema: &Value, depth: usize) -> Result<String> {
    if depth > MAX_DEPTH {
        return Err(invalid("nesting too deep"));
    }
    let obj = match schema {
        Value::Bool(true) => return Ok(any_scalar()),
        Value::Bool(false) => return Err(invalid("schema 'false' admits nothing")),
        Value::Object(obj) => obj,
        _ => return Err(invalid("schema must be an object or boolean")),
    };

    if obj.contains_key("$ref") {
        return Err(invalid("$ref is not supported"));
    }
    if let Some(value) = obj.get("const") {
        return literal(value);
    }
    if let Some(values) = obj.get("enum") {
        let values = values
            .as_array()
            .ok_or_else(|| invalid("enum must be an array"))?;
        if values.is_empty() {
            return Err(invalid("enum is empty"));
        }
        return Ok(alternatives(
            values.iter().map(literal).collect::<Result<_>>()?,
        ));
    }
    for key in ["anyOf", "oneOf"] {
        if let Some(options) = obj.get(key) {
            let options = options
                .as_array()
                .ok_or_else(|| invalid(format!("{key} must be an array")))?;
            if options.is_empty() {
                return Err(invalid(format!("{key} is empty")));
            }
            return Ok(alternatives(
                options
                    .iter()
                    .map(|s| translate(s, depth + 1))
                    .collect::<Result<_>>()?,
            ));
        }
    }

    match obj.get("type") {
        None => Ok(any_scalar()),
        Some(Value::String(ty)) => translate_type(ty, obj, depth),
        Some(Value::Array(types)) => {
            let options = types
                .iter()
                .map(|ty| {
                    ty.as_str()
                        .ok_or_else(|| invalid("type entries must be strings"))
                        .and_then(|ty| translate_type(ty, obj, depth))
                })
                .collect::<Result<Vec<_>>>()?;
            if options.is_empty() {
                return Err(invalid("type list is empty"));
            }
            Ok(alternatives(options))
        }
        Some(_) => Err(invalid("type must be a string or array")),
    }
}

fn bound(obj: &Map<String, Value>, key: &str) -> Result<Option<u32>> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(format!("{key} must be a non-negative integer"))),
    }
}

fn translate_type(ty: &str, obj: &Map<String, Value>, depth: usize) -> Result<String> {
    match ty {
        "string" => {
            if let Some(pattern) = obj.get("pattern") {
                let pattern = pattern
                    .as_str()
                    .ok_or_else(|| invalid("pattern must be a string"))?;
                return Ok(format!("\"(?:{pattern})\""));
            }
            let min = bound(obj, "minLength")?.unwrap_or(0);
            let max = bound(obj, "maxLength")?;
            let repeat = match max {
                Some(max) if max < min => return Err(invalid("maxLength below minLength")),
                Some(max) => format!("{{{min},{max}}}"),
                None if min == 0 => "*".to_string(),
                None => format!("{{{min},}}"),
            };
            Ok(format!("\"{STRING_CHAR}{repeat}\""))
        }
        "integer" => Ok(INTEGER.to_string()),
        "number" => Ok(NUMBER.to_string()),
        "boolean" => Ok(BOOLEAN.to_string()),
        "null" => Ok(NULL.to_string()),
        "array" => translate_array(obj, depth),
        "object" => translate_object(obj, depth),
        other => Err(invalid(format!("unsupported type '{other}'"))),
    }
}

fn translate_array(obj: &Map<String, Value>, depth: usize) -> Result<String> {
    let item = match obj.get("items") {
        Some(items) => translate(items, depth + 1)?,
        None => any_scalar(),
    };
    let min = bound(obj, "minItems")?.unwrap_or(0);
    let max = bound(obj, "maxItems")?;
    if max.is_some_and(|max| max < min) {
        return Err(invalid("maxItems below minItems"));
    }
    if max == Some(0) {
        return Ok(r"\[\]".to_string());
    }
    let rest_min = min.saturating_sub(1);
    let rest = match max {
        Some(max) => format!("{{{rest_min},{}}}", max - 1),
        None if rest_min == 0 => "*".to_string(),
        None => format!("{{{rest_min},}}"),
    };
    let body = format!("{item}(?:,{item}){rest}");
    Ok(if min == 0 {
        format!(r"\[(?:{body})?\]")
    } else {
        format!(r"\[{body}\]")
    })
}

fn translate_object(obj: &Map<String, Value>, depth: usize) -> Result<String> {
    let properties = match obj.get("properties") {
        None => return Ok(r"\{\}".to_string()),
        Some(Value::Object(properties)) => properties,
        Some(_) => return Err(invalid("properties must be an object")),
    };
    let required: Vec<&str> = match obj.get("required") {
        None => Vec::new(),
        Some(Value::Array(names)) => names
            .iter()
            .map(|n| n.as_str().ok_or_else(|| invalid("required entries must be strings")))
            .collect::<Result<_>>()?,
        Some(_) => return Err(invalid("required must be an array")),
    };
    for name in &required {
        if !properties.contains_key(*name) {
            return Err(invalid(format!("required property '{name}' is not defined")));
        }
    }

    let mut members = Vec::with_capacity(properties.len());
    for (name, schema) in properties {
        let key = literal(&Value::String(name.clone()))?;
        let value = translate(schema, depth + 1)?;
        members.push((format!("{key}:{value}"), required.contains(&name.as_str())));
    }
    if members.is_empty() {
        return Ok(r"\{\}".to_string());
    }

    // Members after index `i`, each with a leading comma.
    let tail = |i: usize| -> String {
        members[i + 1..]
            .iter()
            .map(|(member, required)| {
                if *required {
                    format!(",{member}")
                } else {
                    format!("(?:,{member})?")
                }
            })
            .collect()
    };

    // Choose which member comes first; everything before it must be optional.
    let mut options = Vec::new();
    for (i, (member, required)) in members.iter().enumerate() {
        options.push(format!("{member}{}", tail(i)));
        if *required {
            break;
        }
    }
    let all_optional = members.iter().all(|(_, required)| !required);
    let body = alternatives(options);
    Ok(if all_optional {
        format!(r"\{{(?:{body})?\}}")
    } else {
        format!(r"\{{{body}\}}")
    })
}

//! Parsing of raw attribute values into unbound expression trees.
//!
//! Strings may embed `${...}` interpolations. A string that is exactly one
//! interpolation yields the referenced value with its type preserved; any
//! other mix of text and interpolations is a template that renders to a
//! string. `$${` produces a literal `${`.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ConfigError;

/// An expression as written, before per-instance binding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawExpr {
    /// A constant value.
    Literal(Value),
    /// Reference to another resource (`TYPE.NAME[INDEX].PATH`).
    Ref(RawRef),
    /// Reference to a document variable (`var.NAME[INDEX].PATH`).
    Var {
        /// Variable name.
        name: String,
        /// Optional index applied to the variable value.
        index: Option<RawIndex>,
        /// Path below the (indexed) value.
        path: Vec<String>,
    },
    /// `count.index`.
    CountIndex,
    /// `each.key`.
    EachKey,
    /// `each.value` with an optional path into it.
    EachValue(Vec<String>),
    /// Text and interpolations concatenated into a string.
    Template(Vec<RawExpr>),
    /// A list of expressions.
    List(Vec<RawExpr>),
    /// A map of expressions.
    Object(BTreeMap<String, RawExpr>),
}

/// An unbound resource reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRef {
    /// The reference text as written, used in error messages.
    pub text: String,
    /// Referenced resource type.
    pub resource_type: String,
    /// Referenced resource name.
    pub name: String,
    /// Optional instance selector.
    pub index: Option<RawIndex>,
    /// Attribute path below the instance.
    pub path: Vec<String>,
}

/// Instance or element selector inside brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawIndex {
    /// `[3]`
    Int(usize),
    /// `["key"]`
    Key(String),
    /// `[count.index]`
    CountIndex,
    /// `[each.key]`
    EachKey,
    /// `[*]`
    Splat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Name(String),
    Index(RawIndex),
}

/// Parses a raw attribute value.
///
/// # Errors
///
/// Returns `InvalidExpression` naming `location` if an interpolation is
/// malformed.
pub fn parse_value(value: &Value, location: &str) -> Result<RawExpr, ConfigError> {
    match value {
        Value::String(s) => parse_string(s, location),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_value(item, &format!("{location}[{i}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(RawExpr::List),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| {
                parse_value(item, &format!("{location}.{key}")).map(|expr| (key.clone(), expr))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(RawExpr::Object),
        other => Ok(RawExpr::Literal(other.clone())),
    }
}

/// Parses a string that may contain interpolations.
///
/// # Errors
///
/// Returns `InvalidExpression` if an interpolation is malformed.
pub fn parse_string(input: &str, location: &str) -> Result<RawExpr, ConfigError> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        let after = &rest[pos..];
        if after.starts_with("$${") {
            text.push_str(&rest[..pos]);
            text.push_str("${");
            rest = &after[3..];
        } else if after.starts_with("${") {
            text.push_str(&rest[..pos]);
            let body = &after[2..];
            let end = find_closing_brace(body)
                .ok_or_else(|| ConfigError::expression(location, "unterminated ${"))?;
            if !text.is_empty() {
                parts.push(RawExpr::Literal(Value::String(std::mem::take(&mut text))));
            }
            parts.push(parse_reference(&body[..end], location)?);
            rest = &body[end + 1..];
        } else {
            text.push_str(&rest[..=pos]);
            rest = &after[1..];
        }
    }
    text.push_str(rest);
    if !text.is_empty() {
        parts.push(RawExpr::Literal(Value::String(text)));
    }

    Ok(match parts.len() {
        0 => RawExpr::Literal(Value::String(String::new())),
        1 => parts.remove(0),
        _ => RawExpr::Template(parts),
    })
}

/// Returns the byte offset of the `}` closing an interpolation, skipping
/// quoted keys.
fn find_closing_brace(body: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (i, c) in body.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '}' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

/// Parses the inside of one `${...}`.
fn parse_reference(source: &str, location: &str) -> Result<RawExpr, ConfigError> {
    let text = source.trim();
    let invalid = |message: String| ConfigError::expression(location, message);
    let segments = tokenize(text).map_err(|m| invalid(format!("{m} in '{text}'")))?;

    let mut iter = segments.into_iter();
    let Some(Segment::Name(head)) = iter.next() else {
        return Err(invalid(format!("'{text}' must start with a name")));
    };

    match head.as_str() {
        "count" => match (iter.next(), iter.next()) {
            (Some(Segment::Name(field)), None) if field == "index" => Ok(RawExpr::CountIndex),
            _ => Err(invalid(format!("'{text}': only count.index is supported"))),
        },
        "each" => match iter.next() {
            Some(Segment::Name(field)) if field == "key" => {
                if iter.next().is_some() {
                    return Err(invalid(format!("'{text}': each.key has no attributes")));
                }
                Ok(RawExpr::EachKey)
            }
            Some(Segment::Name(field)) if field == "value" => {
                Ok(RawExpr::EachValue(static_path(iter, text, location)?))
            }
            _ => Err(invalid(format!("'{text}': expected each.key or each.value"))),
        },
        "var" => {
            let Some(Segment::Name(name)) = iter.next() else {
                return Err(invalid(format!("'{text}': expected var.NAME")));
            };
            let mut iter = iter.peekable();
            let index = match iter.peek() {
                Some(Segment::Index(_)) => match iter.next() {
                    Some(Segment::Index(index)) => Some(index),
                    _ => None,
                },
                _ => None,
            };
            Ok(RawExpr::Var {
                name,
                index,
                path: static_path(iter, text, location)?,
            })
        }
        _ => {
            let Some(Segment::Name(name)) = iter.next() else {
                return Err(invalid(format!("'{text}': expected TYPE.NAME")));
            };
            let mut iter = iter.peekable();
            let index = match iter.peek() {
                Some(Segment::Index(_)) => match iter.next() {
                    Some(Segment::Index(index)) => Some(index),
                    _ => None,
                },
                _ => None,
            };
            Ok(RawExpr::Ref(RawRef {
                text: text.to_string(),
                resource_type: head,
                name,
                index,
                path: static_path(iter, text, location)?,
            }))
        }
    }
}

/// Converts the remaining segments into a literal attribute path.
fn static_path(
    segments: impl Iterator<Item = Segment>,
    text: &str,
    location: &str,
) -> Result<Vec<String>, ConfigError> {
    segments
        .map(|segment| match segment {
            Segment::Name(name) => Ok(name),
            Segment::Index(RawIndex::Int(i)) => Ok(i.to_string()),
            Segment::Index(RawIndex::Key(key)) => Ok(key),
            Segment::Index(_) => Err(ConfigError::expression(
                location,
                format!("'{text}': dynamic index is only allowed right after a resource or variable"),
            )),
        })
        .collect()
}

/// Splits `a.b["k"][0].c` into segments.
fn tokenize(text: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut chars = text.char_indices().peekable();
    let mut expect_name = true;

    while let Some(&(start, c)) = chars.peek() {
        match c {
            '.' if !expect_name => {
                chars.next();
                expect_name = true;
            }
            '[' => {
                chars.next();
                let mut inner = String::new();
                let mut in_quotes = false;
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    match c {
                        '"' => {
                            in_quotes = !in_quotes;
                            inner.push(c);
                        }
                        ']' if !in_quotes => {
                            closed = true;
                            break;
                        }
                        _ => inner.push(c),
                    }
                }
                if !closed {
                    return Err(String::from("unterminated ["));
                }
                segments.push(Segment::Index(parse_index(inner.trim())?));
                expect_name = false;
            }
            c if expect_name && (c.is_ascii_alphanumeric() || c == '_' || c == '-') => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                segments.push(Segment::Name(text[start..end].to_string()));
                expect_name = false;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    if expect_name && !segments.is_empty() {
        return Err(String::from("trailing '.'"));
    }
    if segments.is_empty() {
        return Err(String::from("empty interpolation"));
    }
    Ok(segments)
}

fn parse_index(inner: &str) -> Result<RawIndex, String> {
    if inner == "*" {
        return Ok(RawIndex::Splat);
    }
    if inner == "count.index" {
        return Ok(RawIndex::CountIndex);
    }
    if inner == "each.key" {
        return Ok(RawIndex::EachKey);
    }
    if let Some(key) = inner.strip_prefix('"').and_then(|k| k.strip_suffix('"')) {
        return Ok(RawIndex::Key(key.to_string()));
    }
    inner
        .parse::<usize>()
        .map(RawIndex::Int)
        .map_err(|_| format!("invalid index '{inner}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(s: &str) -> RawExpr {
        parse_string(s, "test").unwrap()
    }

    #[test]
    fn test_plain_string_is_literal() {
        assert_eq!(parse("hello"), RawExpr::Literal(json!("hello")));
        assert_eq!(parse("cost: $5"), RawExpr::Literal(json!("cost: $5")));
    }

    #[test]
    fn test_escape() {
        assert_eq!(parse("$${not.ref}"), RawExpr::Literal(json!("${not.ref}")));
    }

    #[test]
    fn test_single_interpolation_keeps_reference() {
        let RawExpr::Ref(reference) = parse("${local_dir.root.path}") else {
            panic!("expected a reference");
        };
        assert_eq!(reference.resource_type, "local_dir");
        assert_eq!(reference.name, "root");
        assert_eq!(reference.index, None);
        assert_eq!(reference.path, vec![String::from("path")]);
    }

    #[test]
    fn test_template_parts() {
        let RawExpr::Template(parts) = parse("${a_b.c.id}/file-${count.index}.txt") else {
            panic!("expected a template");
        };
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[2], RawExpr::CountIndex);
        assert_eq!(parts[3], RawExpr::Literal(json!(".txt")));
    }

    #[test]
    fn test_indexes() {
        let RawExpr::Ref(r) = parse("${t.n[2].a}") else { panic!() };
        assert_eq!(r.index, Some(RawIndex::Int(2)));

        let RawExpr::Ref(r) = parse("${t.n[\"eu}\"].a}") else { panic!() };
        assert_eq!(r.index, Some(RawIndex::Key(String::from("eu}"))));

        let RawExpr::Ref(r) = parse("${t.n[each.key]}") else { panic!() };
        assert_eq!(r.index, Some(RawIndex::EachKey));

        let RawExpr::Ref(r) = parse("${t.n[*].id}") else { panic!() };
        assert_eq!(r.index, Some(RawIndex::Splat));
    }

    #[test]
    fn test_variables_and_each() {
        assert_eq!(
            parse("${var.names[count.index]}"),
            RawExpr::Var {
                name: String::from("names"),
                index: Some(RawIndex::CountIndex),
                path: vec![],
            }
        );
        assert_eq!(
            parse("${each.value.size}"),
            RawExpr::EachValue(vec![String::from("size")])
        );
        assert_eq!(parse("${ each.key }"), RawExpr::EachKey);
    }

    #[test]
    fn test_nested_values() {
        let value = json!({"list": ["${count.index}", 1], "flag": true});
        let RawExpr::Object(map) = parse_value(&value, "attrs").unwrap() else {
            panic!("expected an object");
        };
        assert_eq!(
            map["list"],
            RawExpr::List(vec![RawExpr::CountIndex, RawExpr::Literal(json!(1))])
        );
        assert_eq!(map["flag"], RawExpr::Literal(json!(true)));
    }

    #[test]
    fn test_malformed() {
        for bad in ["${", "${}", "${a.}", "${count.value}", "${t.n.list[count.index]}", "${t}"] {
            assert!(parse_string(bad, "test").is_err(), "{bad} should fail");
        }
    }
}

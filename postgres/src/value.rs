//! parameter values: the shapes a caller or a [`crate::model::ModelSchema`] field may hand to
//! a command, and the wire-in/literalization rules that turn them into bind parameters or
//! inline SQL text.
//!
//! there is no type-parser registry on the way back out: rows are handed to sinks as the raw
//! `&str` slices PostgreSQL's text format already gives us. this module only ever produces
//! bytes, never parses them.

use core::fmt::Write as _;

use time::{format_description::well_known::Iso8601, Date, OffsetDateTime};

/// a value bound into a command, either as a `$N` parameter or literalized directly into the
/// query text.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(OffsetDateTime),
    Date(Date),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    /// encode as a bind parameter: `(format_code, payload)`, format `0` for text and `1` for
    /// binary. only [`Value::Bytes`] travels as binary; everything else is text, matching
    /// the "no type-parser registry" design: the server is told the format per-parameter via
    /// `frontend::bind`'s format list, not inferred from a prepared statement's parameter types.
    pub(crate) fn to_bind_param(&self) -> (i16, Option<Vec<u8>>) {
        match self {
            Value::Null => (0, None),
            Value::Bytes(b) => (1, Some(b.clone())),
            other => (0, Some(other.to_text().into_bytes())),
        }
    }

    /// natural text-format rendering, shared by bind-parameter encoding and array-literal
    /// construction.
    fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.is_finite() {
                    f.to_string()
                } else if f.is_nan() {
                    "NaN".to_string()
                } else if *f > 0.0 {
                    "Infinity".to_string()
                } else {
                    "-Infinity".to_string()
                }
            }
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => format!("\\x{}", hex_encode(b)),
            Value::Timestamp(ts) => ts
                .format(&Iso8601::DEFAULT)
                .expect("OffsetDateTime always formats as ISO-8601"),
            Value::Date(d) => d.to_string(),
            Value::Json(v) => v.to_string(),
            Value::Array(items) => array_literal(items),
        }
    }

    /// render this value as it should appear directly in query text: either an inline literal
    /// (numbers, booleans, timestamps, dates, scalar arrays) or, when inlining would be unsafe
    /// or ambiguous (free-form text, bytes, JSON objects, nested arrays carrying those), a
    /// `$N` placeholder whose actual value is returned alongside to be pushed onto the
    /// command's parameter list.
    ///
    /// `next_param` is the 1-based index the placeholder should use if one is needed.
    pub(crate) fn literalize(&self, next_param: usize) -> (String, Option<Value>) {
        match self {
            Value::Null => ("NULL".to_string(), None),
            Value::Bool(b) => (b.to_string(), None),
            Value::Int(i) => (i.to_string(), None),
            Value::Float(_) => (self.to_text(), None),
            Value::Timestamp(_) | Value::Date(_) => (quote_literal(&self.to_text()), None),
            Value::Array(items) if items.iter().all(Value::is_scalar) => {
                (quote_literal(&array_literal(items)), None)
            }
            Value::Text(s) if !needs_placeholder_text(s) => (quote_literal(s), None),
            _ => (format!("${next_param}"), Some(self.clone())),
        }
    }

    fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Timestamp(_) | Value::Date(_)
        ) || matches!(self, Value::Text(s) if !needs_placeholder_text(s))
    }
}

fn needs_placeholder_text(s: &str) -> bool {
    s.contains('\'') || s.contains('\\')
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// a PostgreSQL array literal `{a,b,c}`, escaping embedded quotes/backslashes per element and
/// hex-encoding nested byte buffers; nested arrays recurse.
fn array_literal(items: &[Value]) -> String {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Value::Null => out.push_str("NULL"),
            Value::Array(inner) => out.push_str(&array_literal(inner)),
            other => {
                let text = other.to_text();
                out.push('"');
                for c in text.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
        }
    }
    out.push('}');
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scalars_literalize_inline() {
        assert_eq!(Value::Int(42).literalize(1), ("42".to_string(), None));
        assert_eq!(Value::Bool(true).literalize(1), ("true".to_string(), None));
        assert_eq!(Value::Null.literalize(1), ("NULL".to_string(), None));
    }

    #[test]
    fn plain_text_literalizes_inline() {
        let (sql, param) = Value::Text("hello".into()).literalize(1);
        assert_eq!(sql, "'hello'");
        assert!(param.is_none());
    }

    #[test]
    fn unsafe_text_becomes_placeholder() {
        let (sql, param) = Value::Text("O'Brien".into()).literalize(3);
        assert_eq!(sql, "$3");
        assert_eq!(param, Some(Value::Text("O'Brien".into())));
    }

    #[test]
    fn bytes_always_become_a_placeholder() {
        let (sql, param) = Value::Bytes(vec![1, 2, 3]).literalize(1);
        assert_eq!(sql, "$1");
        assert!(param.is_some());
    }

    #[test]
    fn scalar_array_literalizes_inline() {
        let (sql, param) = Value::Array(vec![Value::Int(1), Value::Int(2)]).literalize(1);
        assert_eq!(sql, "'{1,2}'");
        assert!(param.is_none());
    }

    #[test]
    fn array_of_text_hex_escapes_embedded_quotes() {
        let lit = array_literal(&[Value::Text("a\"b".into())]);
        assert_eq!(lit, r#"{"a\"b"}"#);
    }

    #[test]
    fn json_object_becomes_a_placeholder() {
        let v = Value::Json(serde_json::json!({"a": 1}));
        let (sql, param) = v.literalize(2);
        assert_eq!(sql, "$2");
        assert!(param.is_some());
    }

    #[test]
    fn bytes_bind_param_is_binary_format() {
        let (fmt, payload) = Value::Bytes(vec![0xde, 0xad]).to_bind_param();
        assert_eq!(fmt, 1);
        assert_eq!(payload, Some(vec![0xde, 0xad]));
    }

    #[test]
    fn null_bind_param_has_no_payload() {
        let (fmt, payload) = Value::Null.to_bind_param();
        assert_eq!(fmt, 0);
        assert!(payload.is_none());
    }
}

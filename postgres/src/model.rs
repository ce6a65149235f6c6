//! declarative model schema: table name, id generator, and a fixed-tag field set, plus the
//! query-builder methods attached to each schema.
//!
//! grounded on the host crate's typed-statement surface (`statement/mod.rs`'s column/type
//! bookkeeping) for the column/type bookkeeping shape, generalized here from a compiled
//! prepared-statement's `Vec<Column>` to a declaratively-built, dynamically-queried schema.

use core::fmt;

use std::{
    borrow::Cow,
    sync::atomic::{AtomicU64, Ordering},
};

use time::{macros::format_description, format_description::well_known::Iso8601, Date, OffsetDateTime};
use uuid::Uuid;

use super::{
    fault::Fault,
    session::Session,
    value::Value,
};

/// the fixed set of field shapes a model column may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Timestamp,
    Date,
    Object,
    Array,
}

/// a caller-supplied equality override for [`FieldType::Object`]/[`FieldType::Array`] fields
/// whose default deep-equality comparison isn't appropriate (e.g. a JSON blob with
/// non-deterministic key order, or a value that should never be considered "changed").
pub type AreEqual = fn(&Value, &Value) -> bool;

/// parse a raw text-format column value into a field's in-memory representation.
pub type ParseFn = fn(&str) -> Result<Value, Fault>;

/// convert a field's in-memory value into the [`Value`] that gets bound/literalized at flush
/// time. fallible: a handler that can't render its value (an unserializable payload, a broken
/// custom codec) reports it here rather than panicking mid-flush.
pub type SerializeFn = fn(&Value) -> Result<Value, Fault>;

/// a custom marshaling strategy for an [`FieldType::Object`]/[`FieldType::Array`] field, used
/// in place of the default JSON/array-literal handling.
#[derive(Clone, Copy)]
pub struct CustomCodec {
    pub parse: ParseFn,
    pub serialize: SerializeFn,
}

/// one column of a [`ModelSchema`].
#[derive(Clone)]
pub struct Field {
    pub(crate) name: String,
    pub(crate) column: String,
    pub(crate) ty: FieldType,
    pub(crate) readonly: bool,
    pub(crate) are_equal: Option<AreEqual>,
    pub(crate) codec: Option<CustomCodec>,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("ty", &self.ty)
            .field("readonly", &self.readonly)
            .field("are_equal", &self.are_equal.is_some())
            .field("codec", &self.codec.is_some())
            .finish()
    }
}

impl Field {
    /// a non-readonly field with no custom equality handler.
    pub fn new(name: impl Into<String>, ty: FieldType) -> Result<Self, Fault> {
        Self::build(name.into(), ty, false, None, None)
    }

    pub fn readonly(name: impl Into<String>, ty: FieldType) -> Result<Self, Fault> {
        Self::build(name.into(), ty, true, None, None)
    }

    /// a mutable [`FieldType::Object`]/[`FieldType::Array`] field with a custom equality rule.
    pub fn with_equality(name: impl Into<String>, ty: FieldType, are_equal: AreEqual) -> Result<Self, Fault> {
        Self::build(name.into(), ty, false, Some(are_equal), None)
    }

    /// a mutable [`FieldType::Object`]/[`FieldType::Array`] field with a full custom handler:
    /// parse/serialize replace the default JSON/array-literal rendering, and `are_equal`
    /// (when given) replaces the default deep-equality change check.
    pub fn with_codec(
        name: impl Into<String>,
        ty: FieldType,
        codec: CustomCodec,
        are_equal: Option<AreEqual>,
    ) -> Result<Self, Fault> {
        Self::build(name.into(), ty, false, are_equal, Some(codec))
    }

    fn build(
        name: String,
        ty: FieldType,
        readonly: bool,
        are_equal: Option<AreEqual>,
        codec: Option<CustomCodec>,
    ) -> Result<Self, Fault> {
        if name.is_empty() {
            return Err(Fault::model("field name must not be empty"));
        }
        if are_equal.is_some() && !matches!(ty, FieldType::Object | FieldType::Array) {
            return Err(Fault::model(format!(
                "field `{name}`: a custom equality handler is only allowed on Object/Array fields"
            )));
        }
        if codec.is_some() && !matches!(ty, FieldType::Object | FieldType::Array) {
            return Err(Fault::model(format!(
                "field `{name}`: a custom handler is only allowed on Object/Array fields"
            )));
        }
        let column = derive_column_name(&name);
        Ok(Field {
            name,
            column,
            ty,
            readonly,
            are_equal,
            codec,
        })
    }

    pub(crate) fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match self.are_equal {
            Some(f) => f(a, b),
            None => a == b,
        }
    }

    /// `column_name AS "fieldName"` when the derived column name differs from the field name,
    /// bare `column_name` otherwise.
    pub(crate) fn select_expr(&self) -> String {
        if self.column == self.name {
            self.column.clone()
        } else {
            format!("{} AS \"{}\"", self.column, self.name)
        }
    }

    /// convert a row's raw text-format value for this column into the field's in-memory
    /// [`Value`]. `None` (SQL `NULL`) always yields [`Value::Null`] regardless of `ty`.
    pub(crate) fn parse_raw(&self, raw: Option<&str>) -> Result<Value, Fault> {
        let Some(raw) = raw else {
            return Ok(Value::Null);
        };
        match self.ty {
            FieldType::String => Ok(Value::Text(raw.to_string())),
            FieldType::Number => parse_number(&self.name, raw),
            FieldType::Boolean => parse_boolean(&self.name, raw),
            FieldType::Timestamp => parse_timestamp(&self.name, raw),
            FieldType::Date => parse_date(&self.name, raw),
            FieldType::Object => match self.codec {
                Some(codec) => (codec.parse)(raw),
                None => parse_json(&self.name, raw),
            },
            FieldType::Array => match self.codec {
                Some(codec) => (codec.parse)(raw),
                None => Ok(parse_pg_array(raw)),
            },
        }
    }

    /// render this field's current in-memory value into the [`Value`] that actually gets
    /// bound/literalized into an `INSERT`/`UPDATE`. a no-op for every type except
    /// Object/Array fields carrying a [`CustomCodec`].
    pub(crate) fn serialize_for_write(&self, value: &Value) -> Result<Value, Fault> {
        match (self.ty, self.codec) {
            (FieldType::Object | FieldType::Array, Some(codec)) => (codec.serialize)(value),
            _ => Ok(value.clone()),
        }
    }
}

fn parse_number(field: &str, raw: &str) -> Result<Value, Fault> {
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    raw.parse::<f64>()
        .map(Value::Float)
        .map_err(|e| Fault::parse(format!("field `{field}`: invalid number `{raw}`: {e}")))
}

fn parse_boolean(field: &str, raw: &str) -> Result<Value, Fault> {
    match raw {
        "t" | "true" | "TRUE" | "T" => Ok(Value::Bool(true)),
        "f" | "false" | "FALSE" | "F" => Ok(Value::Bool(false)),
        _ => Err(Fault::parse(format!("field `{field}`: invalid boolean `{raw}`"))),
    }
}

/// postgres renders timestamps as `YYYY-MM-DD HH:MM:SS[.ffffff][+HH[:MM]]`; normalize the
/// separating space into the `T` ISO-8601 expects before parsing.
fn parse_timestamp(field: &str, raw: &str) -> Result<Value, Fault> {
    let candidate = if raw.contains('T') {
        Cow::Borrowed(raw)
    } else {
        Cow::Owned(raw.replacen(' ', "T", 1))
    };
    OffsetDateTime::parse(&candidate, &Iso8601::DEFAULT)
        .map(Value::Timestamp)
        .map_err(|e| Fault::parse(format!("field `{field}`: invalid timestamp `{raw}`: {e}")))
}

fn parse_date(field: &str, raw: &str) -> Result<Value, Fault> {
    let fmt = format_description!("[year]-[month]-[day]");
    Date::parse(raw, &fmt)
        .map(Value::Date)
        .map_err(|e| Fault::parse(format!("field `{field}`: invalid date `{raw}`: {e}")))
}

fn parse_json(field: &str, raw: &str) -> Result<Value, Fault> {
    serde_json::from_str(raw)
        .map(Value::Json)
        .map_err(|e| Fault::parse(format!("field `{field}`: invalid json `{raw}`: {e}")))
}

/// a minimal reader for postgres' `{a,b,c}` array text format: double-quoted elements have
/// their escapes undone, bare elements are taken verbatim, and `NULL` (unquoted) becomes SQL
/// null. good enough for the common case of a flat array of scalars; nested arrays are not
/// unpacked and are returned as opaque text elements.
fn parse_pg_array(raw: &str) -> Value {
    let inner = raw.trim().strip_prefix('{').and_then(|s| s.strip_suffix('}')).unwrap_or(raw);
    if inner.is_empty() {
        return Value::Array(Vec::new());
    }
    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        match c {
            '"' if !in_quotes => in_quotes = true,
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' if !in_quotes => {
                items.push(take_array_element(&mut current));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    items.push(take_array_element(&mut current));
    Value::Array(items)
}

fn take_array_element(raw: &mut String) -> Value {
    if raw == "NULL" {
        Value::Null
    } else {
        Value::Text(core::mem::take(raw))
    }
}

/// camelCase -> snake_case; single-word names pass through unchanged.
pub(crate) fn derive_column_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// capability an id generator must expose: mint the next primary key, given the session it will
/// be inserted through (a sequence-backed generator needs to run a query; a UUID generator
/// doesn't).
pub trait IdGenerator: Send + Sync {
    fn next_id(&self, session: &Session) -> Result<String, Fault> {
        let _ = session;
        Err(Fault::model("id generator does not support synchronous id generation"))
    }
}

/// mints ids from a PostgreSQL sequence via `SELECT nextval($1)`. synchronous id generation is
/// unsupported: sequence-backed ids require a round trip, so schemas using this generator must
/// mint ids through `Session::next_id_async` (a query-backed path, not this trait's synchronous
/// `next_id`).
pub struct SequenceIdGenerator {
    pub sequence: String,
}

impl SequenceIdGenerator {
    pub fn new(sequence: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
        }
    }
}

impl IdGenerator for SequenceIdGenerator {}

/// mints v4 UUIDs with no I/O. convenient for fixtures/tests where a schema is exercised without
/// a live sequence.
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self, _session: &Session) -> Result<String, Fault> {
        Ok(Uuid::new_v4().to_string())
    }
}

/// monotonic in-process id generator, useful for deterministic tests that don't want UUID
/// randomness.
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self, _session: &Session) -> Result<String, Fault> {
        Ok(self.next.fetch_add(1, Ordering::Relaxed).to_string())
    }
}

/// a selector passed to `fetch_one`/`fetch_all`: either an ANDed equality map, an ORed list of
/// such maps, raw SQL inlined into the `WHERE` clause, or an operator applied to one field.
#[derive(Debug, Clone)]
pub enum Selector {
    Eq(Vec<(String, Value)>),
    Or(Vec<Vec<(String, Value)>>),
    Raw(String),
    Op(String, Operator),
}

#[derive(Debug, Clone)]
pub enum Operator {
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    Contains(Value),
}

impl Selector {
    pub fn eq(pairs: impl IntoIterator<Item = (impl Into<String>, Value)>) -> Self {
        Self::Eq(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// a declared model type: table name, id generator, and field set, plus the query text this
/// type's rows are read and written through.
pub struct ModelSchema {
    pub(crate) table: String,
    pub(crate) id_generator: Box<dyn IdGenerator>,
    pub(crate) fields: Vec<Field>,
}

impl ModelSchema {
    /// validate and build a schema. all failures here are fatal at schema-build time: a schema
    /// that doesn't validate is never usable, not merely unusable for certain queries.
    ///
    /// `id` (readonly `String`), `createdOn` (readonly `Timestamp`), and `updatedOn` (mutable
    /// `Timestamp`) are implicit on every schema: a caller that omits them gets them injected
    /// automatically so `q_insert_model`/`q_update_model` always carry them, and a caller that
    /// declares one explicitly keeps full control over its type/readonly/codec.
    pub fn build(
        table: impl Into<String>,
        id_generator: Box<dyn IdGenerator>,
        fields: Vec<Field>,
    ) -> Result<Self, Fault> {
        let table = table.into();
        if table.trim().is_empty() {
            return Err(Fault::model("schema table name must not be empty"));
        }
        if fields.is_empty() {
            return Err(Fault::model("schema has no fields"));
        }
        let mut seen = std::collections::HashSet::new();
        for f in &fields {
            if !seen.insert(f.name.clone()) {
                return Err(Fault::model(format!("duplicate field name `{}`", f.name)));
            }
        }
        let mut fields = fields;
        for (name, ty, readonly) in [
            ("id", FieldType::String, true),
            ("createdOn", FieldType::Timestamp, true),
            ("updatedOn", FieldType::Timestamp, false),
        ] {
            if seen.insert(name.to_string()) {
                fields.push(Field::build(name.to_string(), ty, readonly, None, None)?);
            }
        }
        Ok(Self {
            table,
            id_generator,
            fields,
        })
    }

    pub(crate) fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub(crate) fn id_field(&self) -> &Field {
        self.field("id").expect("every model schema carries an `id` field")
    }

    /// `SELECT <cols> FROM <table> WHERE <selector> [FOR UPDATE]`.
    pub(crate) fn q_select_one_model(&self, selector: &Selector, mutable: bool) -> Result<(String, Vec<Value>), Fault> {
        self.q_select(selector, mutable, true)
    }

    pub(crate) fn q_select_all_models(&self, selector: &Selector, mutable: bool) -> Result<(String, Vec<Value>), Fault> {
        self.q_select(selector, mutable, false)
    }

    fn q_select(&self, selector: &Selector, mutable: bool, single: bool) -> Result<(String, Vec<Value>), Fault> {
        let cols = self.fields.iter().map(Field::select_expr).collect::<Vec<_>>().join(", ");
        let (where_clause, params) = self.render_selector(selector)?;
        let mut sql = format!("SELECT {cols} FROM {} WHERE {where_clause}", self.table);
        if single {
            sql.push_str(" LIMIT 1");
        }
        if mutable {
            sql.push_str(" FOR UPDATE");
        }
        Ok((sql, params))
    }

    fn render_selector(&self, selector: &Selector) -> Result<(String, Vec<Value>), Fault> {
        let mut params = Vec::new();
        let clause = match selector {
            Selector::Eq(pairs) => self.render_and(pairs, &mut params)?,
            Selector::Or(groups) => {
                let mut rendered = Vec::with_capacity(groups.len());
                for g in groups {
                    rendered.push(format!("({})", self.render_and(g, &mut params)?));
                }
                rendered.join(" OR ")
            }
            Selector::Raw(sql) => sql.clone(),
            Selector::Op(field_name, op) => self.render_op(field_name, op, &mut params)?,
        };
        if clause.trim().is_empty() {
            return Err(Fault::model("selector must not be empty"));
        }
        Ok((clause, params))
    }

    fn render_and(&self, pairs: &[(String, Value)], params: &mut Vec<Value>) -> Result<String, Fault> {
        let mut parts = Vec::with_capacity(pairs.len());
        for (name, value) in pairs {
            let field = self
                .field(name)
                .ok_or_else(|| Fault::model(format!("selector references unknown column `{name}`")))?;
            params.push(value.clone());
            parts.push(format!("{} = ${}", field.column, params.len()));
        }
        Ok(parts.join(" AND "))
    }

    fn render_op(&self, field_name: &str, op: &Operator, params: &mut Vec<Value>) -> Result<String, Fault> {
        let field = self
            .field(field_name)
            .ok_or_else(|| Fault::model(format!("selector references unknown column `{field_name}`")))?;
        let col = &field.column;
        Ok(match op {
            Operator::In(values) | Operator::NotIn(values) => {
                let placeholders = values
                    .iter()
                    .map(|v| {
                        params.push(v.clone());
                        format!("${}", params.len())
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let kw = if matches!(op, Operator::In(_)) { "IN" } else { "NOT IN" };
                format!("{col} {kw} ({placeholders})")
            }
            Operator::Lt(v) => {
                params.push(v.clone());
                format!("{col} < ${}", params.len())
            }
            Operator::Lte(v) => {
                params.push(v.clone());
                format!("{col} <= ${}", params.len())
            }
            Operator::Gt(v) => {
                params.push(v.clone());
                format!("{col} > ${}", params.len())
            }
            Operator::Gte(v) => {
                params.push(v.clone());
                format!("{col} >= ${}", params.len())
            }
            Operator::Contains(v) => {
                params.push(v.clone());
                format!("{col} @> ${}", params.len())
            }
        })
    }

    /// `INSERT INTO <table> (<cols>) VALUES (<literalized or $-bound values>)`.
    pub(crate) fn q_insert_model(&self, values: &[(String, Value)]) -> Result<(String, Vec<Value>), Fault> {
        let mut cols = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        let mut params = Vec::new();
        for (name, value) in values {
            let field = self
                .field(name)
                .ok_or_else(|| Fault::model(format!("insert references unknown column `{name}`")))?;
            let value = field.serialize_for_write(value)?;
            cols.push(field.column.clone());
            let (rendered, param) = value.literalize(params.len() + 1);
            if let Some(p) = param {
                params.push(p);
            }
            placeholders.push(rendered);
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            cols.join(", "),
            placeholders.join(", ")
        );
        Ok((sql, params))
    }

    /// `UPDATE <table> SET <col>=<val>,... WHERE id = <id>`.
    pub(crate) fn q_update_model(&self, id: &Value, sets: &[(String, Value)]) -> Result<(String, Vec<Value>), Fault> {
        let mut params = Vec::new();
        let mut assigns = Vec::with_capacity(sets.len());
        for (name, value) in sets {
            let field = self
                .field(name)
                .ok_or_else(|| Fault::model(format!("update references unknown column `{name}`")))?;
            let value = field.serialize_for_write(value)?;
            let (rendered, param) = value.literalize(params.len() + 1);
            if let Some(p) = param {
                params.push(p);
            }
            assigns.push(format!("{} = {}", field.column, rendered));
        }
        let (id_sql, id_param) = id.literalize(params.len() + 1);
        if let Some(p) = id_param {
            params.push(p);
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            self.table,
            assigns.join(", "),
            self.id_field().column,
            id_sql
        );
        Ok((sql, params))
    }

    /// `DELETE FROM <table> WHERE id = <id>`.
    pub(crate) fn q_delete_model(&self, id: &Value) -> Result<(String, Vec<Value>), Fault> {
        let (id_sql, id_param) = id.literalize(1);
        let mut params = Vec::new();
        if let Some(p) = id_param {
            params.push(p);
        }
        let sql = format!("DELETE FROM {} WHERE {} = {}", self.table, self.id_field().column, id_sql);
        Ok((sql, params))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema() -> ModelSchema {
        ModelSchema::build(
            "users",
            Box::new(UuidIdGenerator),
            vec![
                Field::readonly("id", FieldType::String).unwrap(),
                Field::new("displayName", FieldType::String).unwrap(),
                Field::readonly("createdOn", FieldType::Timestamp).unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn empty_table_name_is_rejected() {
        assert!(ModelSchema::build("", Box::new(UuidIdGenerator), vec![Field::new("id", FieldType::String).unwrap()]).is_err());
    }

    #[test]
    fn zero_fields_is_rejected() {
        assert!(ModelSchema::build("users", Box::new(UuidIdGenerator), vec![]).is_err());
    }

    #[test]
    fn custom_equality_on_a_scalar_field_is_rejected() {
        assert!(Field::with_equality("x", FieldType::Number, |a, b| a == b).is_err());
    }

    #[test]
    fn column_name_derivation_splits_camel_case() {
        assert_eq!(derive_column_name("createdOn"), "created_on");
        assert_eq!(derive_column_name("id"), "id");
    }

    #[test]
    fn select_expr_aliases_when_names_diverge() {
        let f = Field::new("displayName", FieldType::String).unwrap();
        assert_eq!(f.select_expr(), "display_name AS \"displayName\"");
    }

    #[test]
    fn select_one_adds_for_update_and_limit() {
        let schema = schema();
        let selector = Selector::eq([("id", Value::Text("1".into()))]);
        let (sql, params) = schema.q_select_one_model(&selector, true).unwrap();
        assert!(sql.contains("LIMIT 1"));
        assert!(sql.contains("FOR UPDATE"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn selector_on_unknown_column_is_a_model_error() {
        let schema = schema();
        let selector = Selector::eq([("nope", Value::Int(1))]);
        assert!(schema.q_select_one_model(&selector, false).is_err());
    }

    #[test]
    fn insert_literalizes_scalars_and_placeholders_unsafe_text() {
        let schema = schema();
        let (sql, params) = schema
            .q_insert_model(&[
                ("id".into(), Value::Text("1".into())),
                ("displayName".into(), Value::Text("O'Brien".into())),
            ])
            .unwrap();
        assert!(sql.contains("$1"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn delete_builds_id_equality() {
        let schema = schema();
        let (sql, _) = schema.q_delete_model(&Value::Text("42".into())).unwrap();
        assert!(sql.starts_with("DELETE FROM users WHERE id ="));
    }

    #[test]
    fn build_injects_missing_implicit_fields() {
        let schema = ModelSchema::build(
            "widgets",
            Box::new(UuidIdGenerator),
            vec![Field::new("label", FieldType::String).unwrap()],
        )
        .unwrap();
        assert!(schema.field("id").unwrap().readonly);
        assert!(schema.field("createdOn").unwrap().readonly);
        assert!(!schema.field("updatedOn").unwrap().readonly);
    }

    #[test]
    fn build_respects_an_explicit_declaration_of_an_implicit_field() {
        let schema = ModelSchema::build(
            "widgets",
            Box::new(UuidIdGenerator),
            vec![
                Field::new("id", FieldType::String).unwrap(),
                Field::new("label", FieldType::String).unwrap(),
            ],
        )
        .unwrap();
        assert!(!schema.field("id").unwrap().readonly);
    }
}

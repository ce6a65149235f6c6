//! session-scoped identity map: `(TypeId, id) -> model`, row hydration, change tracking, and
//! `INSERT`/`UPDATE`/`DELETE` statement synthesis at flush time.
//!
//! grounded on the host crate's row-to-`RowSimple`/`RowOwned` hydration in `row.rs` for the
//! "build a typed value from a `RowDescription` + raw column text" shape, generalized here
//! from a one-shot typed row into a long-lived, mutation-tracked entity kept alive by an
//! identity map for the rest of the session.

use core::any::{Any, TypeId};

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use time::OffsetDateTime;

use super::{
    command::{ColumnInfo, RowData, RowHandler},
    fault::Fault,
    model::{Field, ModelSchema},
    value::Value,
};

/// binds a Rust type to the [`ModelSchema`] the store hydrates/flushes it through. the store
/// keys its identity map by `(TypeId::of::<T>(), id)` rather than by table name, so two
/// distinct Rust types are never confused even if they happen to declare the same table.
pub trait Entity: Send + Sync + 'static {
    fn schema() -> &'static ModelSchema;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flags {
    mutable: bool,
    created: bool,
    deleted: bool,
}

/// which fields get an original-value snapshot at load time, selected by
/// [`crate::session::SessionOptions::verify_immutability`] and the fetch's `mutable` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveOriginal {
    DontSave,
    SaveMutableFields,
    SaveAllFields,
}

struct ModelInner {
    values: HashMap<String, Value>,
    original: Option<HashMap<String, Value>>,
    flags: Flags,
}

impl ModelInner {
    fn snapshot(&self, schema: &ModelSchema, mode: SaveOriginal) -> Option<HashMap<String, Value>> {
        match mode {
            SaveOriginal::DontSave => None,
            SaveOriginal::SaveMutableFields => Some(
                schema
                    .fields
                    .iter()
                    .filter(|f| !f.readonly)
                    .map(|f| (f.name.clone(), self.values.get(&f.name).cloned().unwrap_or(Value::Null)))
                    .collect(),
            ),
            SaveOriginal::SaveAllFields => Some(self.values.clone()),
        }
    }

    fn has_changed(&self, schema: &ModelSchema) -> bool {
        let Some(original) = &self.original else {
            return false;
        };
        schema.fields.iter().filter(|f| !f.readonly).any(|f| {
            let cur = self.values.get(&f.name).unwrap_or(&Value::Null);
            let orig = original.get(&f.name).unwrap_or(&Value::Null);
            !f.values_equal(cur, orig)
        })
    }
}

/// an identity-mapped, mutation-tracked handle onto one row. cloning a [`Model`] clones the
/// handle, not the data: all clones observe the same underlying state, matching the identity
/// map's "one in-memory object per primary key" guarantee.
pub struct Model<T> {
    inner: Arc<Mutex<ModelInner>>,
    schema: &'static ModelSchema,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Model<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            schema: self.schema,
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> Model<T> {
    fn new(inner: Arc<Mutex<ModelInner>>) -> Self {
        Self {
            inner,
            schema: T::schema(),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> String {
        match self.get("id") {
            Value::Text(s) => s,
            other => format!("{other:?}"),
        }
    }

    /// the current value of `field`, or [`Value::Null`] if never set.
    pub fn get(&self, field: &str) -> Value {
        let inner = self.inner.lock().unwrap();
        inner.values.get(field).cloned().unwrap_or(Value::Null)
    }

    /// overwrite `field`. rejected if the model isn't [`mutable`](Self::is_mutable), the field
    /// is `readonly`, or the field doesn't exist on the schema — a readonly field can therefore
    /// never diverge from its snapshot at flush time, because it's never writable in the first
    /// place.
    pub fn set(&self, field: &str, value: Value) -> Result<(), Fault> {
        let f = self
            .schema
            .field(field)
            .ok_or_else(|| Fault::model(format!("unknown field `{field}` on this model")))?;
        if f.readonly {
            return Err(Fault::model(format!("field `{field}` is readonly")));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.flags.mutable {
            return Err(Fault::model("cannot mutate a non-mutable model"));
        }
        if inner.flags.deleted {
            return Err(Fault::model("cannot mutate a deleted model"));
        }
        inner.values.insert(field.to_string(), value);
        Ok(())
    }

    pub fn is_mutable(&self) -> bool {
        self.inner.lock().unwrap().flags.mutable
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock().unwrap().flags.deleted
    }

    pub fn is_created(&self) -> bool {
        self.inner.lock().unwrap().flags.created
    }

    /// true if any non-readonly field differs from its snapshot. always false when no
    /// snapshot was taken (a non-mutable fetch outside `verify_immutability`), matching the
    /// "nothing to compare against" case rather than treating it as unconditionally dirty.
    pub fn has_changed(&self) -> bool {
        self.inner.lock().unwrap().has_changed(self.schema)
    }
}

/// a row-by-row hydrator that turns `DataRow`s into identity-mapped [`Model<T>`]s via
/// [`Store::load`], resolving the caller's future with the accumulated list (or, for
/// `mask = single`, the single row already truncated upstream by [`crate::command::Command`]).
pub(crate) struct ModelSink<T: Entity> {
    store: Arc<Store>,
    mutable: bool,
    verify_immutability: bool,
    columns: Vec<ColumnInfo>,
    rows: Vec<Model<T>>,
    reply: Option<tokio::sync::oneshot::Sender<Result<Vec<Model<T>>, Fault>>>,
}

impl<T: Entity> ModelSink<T> {
    pub(crate) fn new(
        store: Arc<Store>,
        mutable: bool,
        verify_immutability: bool,
    ) -> (Box<dyn RowHandler>, tokio::sync::oneshot::Receiver<Result<Vec<Model<T>>, Fault>>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (
            Box::new(Self {
                store,
                mutable,
                verify_immutability,
                columns: Vec::new(),
                rows: Vec::new(),
                reply: Some(tx),
            }),
            rx,
        )
    }
}

impl<T: Entity> RowHandler for ModelSink<T> {
    fn row_description(&mut self, columns: &[ColumnInfo]) {
        self.columns = columns.to_vec();
    }

    fn row(&mut self, row: RowData<'_>) -> Result<(), Fault> {
        let schema = T::schema();
        let mut values = HashMap::with_capacity(self.columns.len());
        for (i, col) in self.columns.iter().enumerate() {
            let field = schema
                .fields
                .iter()
                .find(|f| f.name == col.name)
                .ok_or_else(|| Fault::parse(format!("row carries unmapped column `{}`", col.name)))?;
            values.insert(field.name.clone(), field.parse_raw(row.get(i))?);
        }
        if let Some(model) = self.store.load::<T>(values, self.mutable, self.verify_immutability)? {
            self.rows.push(model);
        }
        Ok(())
    }

    fn end(&mut self, error: Option<&Fault>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(match error {
                Some(e) => Err(e.clone()),
                None => Ok(core::mem::take(&mut self.rows)),
            });
        }
    }
}

struct Entry {
    schema: &'static ModelSchema,
    inner: Arc<Mutex<ModelInner>>,
}

/// the session-owned identity map. never shared across sessions; a [`Store`] is created fresh
/// per [`crate::session::Session`] and dropped with it.
pub struct Store {
    entries: Mutex<HashMap<(TypeId, String), Entry>>,
}

impl Store {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn save_original_mode(verify_immutability: bool, mutable: bool) -> SaveOriginal {
        if verify_immutability {
            SaveOriginal::SaveAllFields
        } else if mutable {
            SaveOriginal::SaveMutableFields
        } else {
            SaveOriginal::DontSave
        }
    }

    /// hydrate one freshly-fetched row into the identity map:
    /// - not present yet: insert a fresh model.
    /// - present and deleted: drop the row silently (`Ok(None)`).
    /// - present and mutable: infuse the new row into the existing instance, failing if the
    ///   instance was created or modified since its last load.
    pub(crate) fn load<T: Entity>(
        &self,
        row: HashMap<String, Value>,
        mutable: bool,
        verify_immutability: bool,
    ) -> Result<Option<Model<T>>, Fault> {
        let schema = T::schema();
        let id = match row.get(schema.id_field().name.as_str()) {
            Some(Value::Text(s)) => s.clone(),
            Some(other) => format!("{other:?}"),
            None => return Err(Fault::model("row is missing its id field")),
        };
        let key = (TypeId::of::<T>(), id.clone());
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get(&key) {
            let mut inner = entry.inner.lock().unwrap();
            if inner.flags.deleted {
                return Ok(None);
            }
            if inner.flags.mutable {
                if inner.flags.created || inner.has_changed(schema) {
                    return Err(Fault::session(format!(
                        "Cannot reload `{id}`: model has been modified"
                    )));
                }
                infuse(&mut inner, schema, &row)?;
            }
            inner.flags.mutable = inner.flags.mutable || mutable;
            drop(inner);
            return Ok(Some(Model::new(entry.inner.clone())));
        }

        let mut inner = ModelInner {
            values: row,
            original: None,
            flags: Flags {
                mutable,
                created: false,
                deleted: false,
            },
        };
        let mode = Self::save_original_mode(verify_immutability, mutable);
        inner.original = inner.snapshot(schema, mode);
        let inner = Arc::new(Mutex::new(inner));
        entries.insert(
            key,
            Entry {
                schema,
                inner: inner.clone(),
            },
        );
        Ok(Some(Model::new(inner)))
    }

    /// synchronous lookup by primary key; performs no I/O.
    pub(crate) fn get_one<T: Entity>(&self, id: &str) -> Option<Model<T>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&(TypeId::of::<T>(), id.to_string()))
            .map(|e| Model::new(e.inner.clone()))
    }

    /// every currently-loaded instance of `T`; performs no I/O.
    pub(crate) fn get_all<T: Entity>(&self) -> Vec<Model<T>> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|((ty, _), _)| *ty == TypeId::of::<T>())
            .map(|(_, e)| Model::new(e.inner.clone()))
            .collect()
    }

    /// construct a brand new `mutable | created` model and record it in the map. fails if an
    /// instance with the same id is already present (callers are expected to use an id
    /// generator that guarantees uniqueness within the transaction).
    pub(crate) fn insert_created<T: Entity>(&self, values: HashMap<String, Value>) -> Result<Model<T>, Fault> {
        let schema = T::schema();
        let id = match values.get(schema.id_field().name.as_str()) {
            Some(Value::Text(s)) => s.clone(),
            _ => return Err(Fault::model("created model is missing its id field")),
        };
        let key = (TypeId::of::<T>(), id);
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&key) {
            return Err(Fault::model("a model with this id is already present in the store"));
        }
        let inner = Arc::new(Mutex::new(ModelInner {
            values,
            original: None,
            flags: Flags {
                mutable: true,
                created: true,
                deleted: false,
            },
        }));
        entries.insert(key, Entry { schema, inner: inner.clone() });
        Ok(Model::new(inner))
    }

    /// seed a non-mutable model from caller-supplied data, bypassing the network entirely.
    /// used to build test fixtures. fails if the key is already present.
    pub(crate) fn load_seed<T: Entity>(&self, values: HashMap<String, Value>) -> Result<Model<T>, Fault> {
        let schema = T::schema();
        let id = match values.get(schema.id_field().name.as_str()) {
            Some(Value::Text(s)) => s.clone(),
            _ => return Err(Fault::model("seeded model is missing its id field")),
        };
        let key = (TypeId::of::<T>(), id);
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&key) {
            return Err(Fault::model("a model with this id is already present in the store"));
        }
        let inner = Arc::new(Mutex::new(ModelInner {
            values,
            original: None,
            flags: Flags {
                mutable: false,
                created: false,
                deleted: false,
            },
        }));
        entries.insert(key, Entry { schema, inner: inner.clone() });
        Ok(Model::new(inner))
    }

    /// mark a model deleted. only legal on a model the store already knows about and that is
    /// already mutable — `deleted ⇒ mutable` is an invariant the model never transitions
    /// into on its own.
    pub(crate) fn delete<T: Entity>(&self, model: &Model<T>) -> Result<(), Fault> {
        let entries = self.entries.lock().unwrap();
        let key = (TypeId::of::<T>(), model.id());
        let Some(entry) = entries.get(&key) else {
            return Err(Fault::model("cannot delete a model that is not present in the store"));
        };
        let mut inner = entry.inner.lock().unwrap();
        if !inner.flags.mutable {
            return Err(Fault::model("cannot delete a non-mutable model"));
        }
        inner.flags.deleted = true;
        Ok(())
    }

    /// true if any loaded model (of any type) currently reports [`Model::has_changed`].
    pub(crate) fn has_dirty_models(&self) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.values().any(|e| {
            let inner = e.inner.lock().unwrap();
            inner.flags.deleted || inner.flags.created || inner.has_changed(e.schema)
        })
    }

    /// build the `(sql, params)` sync statements for every dirty model in the store.
    /// `now` is stamped onto `updatedOn` for every insert/update this call emits.
    pub(crate) fn sync_queries(&self, now: OffsetDateTime) -> Result<Vec<(String, Vec<Value>)>, Fault> {
        let entries = self.entries.lock().unwrap();
        let mut queries = Vec::new();
        for entry in entries.values() {
            let mut inner = entry.inner.lock().unwrap();
            let schema = entry.schema;
            let id_field = schema.id_field();
            let id_value = inner.values.get(&id_field.name).cloned().unwrap_or(Value::Null);

            if inner.flags.deleted {
                queries.push(schema.q_delete_model(&id_value)?);
            } else if inner.flags.created {
                inner.values.insert("updatedOn".to_string(), Value::Timestamp(now));
                let values: Vec<(String, Value)> = schema
                    .fields
                    .iter()
                    .map(|f| (f.name.clone(), inner.values.get(&f.name).cloned().unwrap_or(Value::Null)))
                    .collect();
                queries.push(schema.q_insert_model(&values)?);
            } else if inner.flags.mutable && inner.has_changed(schema) {
                inner.values.insert("updatedOn".to_string(), Value::Timestamp(now));
                let sets: Vec<(String, Value)> = schema
                    .fields
                    .iter()
                    .filter(|f| !f.readonly)
                    .map(|f| (f.name.clone(), inner.values.get(&f.name).cloned().unwrap_or(Value::Null)))
                    .collect();
                queries.push(schema.q_update_model(&id_value, &sets)?);
            }
        }
        Ok(queries)
    }

    /// after a successful flush: drop deleted entries, clear the `created` flag on survivors,
    /// and re-snapshot every remaining mutable model's originals.
    pub(crate) fn rebaseline(&self, verify_immutability: bool) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| !e.inner.lock().unwrap().flags.deleted);
        for entry in entries.values() {
            let mut inner = entry.inner.lock().unwrap();
            inner.flags.created = false;
            let mutable = inner.flags.mutable;
            let mode = Self::save_original_mode(verify_immutability, mutable);
            inner.original = inner.snapshot(entry.schema, mode);
        }
    }
}

fn infuse(inner: &mut ModelInner, schema: &ModelSchema, fresh: &HashMap<String, Value>) -> Result<(), Fault> {
    for field in &schema.fields {
        let Some(new_value) = fresh.get(&field.name) else {
            continue;
        };
        if field.readonly {
            let current = inner.values.get(&field.name).unwrap_or(&Value::Null);
            if !field.values_equal(current, new_value) {
                return Err(Fault::model(format!(
                    "reload of `{}` conflicts with existing readonly field `{}`",
                    schema.table, field.name
                )));
            }
        } else {
            inner.values.insert(field.name.clone(), new_value.clone());
        }
    }
    Ok(())
}

fn _assert_store_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<Store>();
}

#[allow(dead_code)]
fn _assert_any_bound<T: Any>() {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Field, FieldType, ModelSchema, UuidIdGenerator};
    use std::sync::OnceLock;

    struct User;

    fn user_schema() -> &'static ModelSchema {
        static SCHEMA: OnceLock<ModelSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ModelSchema::build(
                "users",
                Box::new(UuidIdGenerator),
                vec![
                    Field::readonly("id", FieldType::String).unwrap(),
                    Field::new("username", FieldType::String).unwrap(),
                    Field::readonly("createdOn", FieldType::Timestamp).unwrap(),
                    Field::new("updatedOn", FieldType::Timestamp).unwrap(),
                ],
            )
            .unwrap()
        })
    }

    impl Entity for User {
        fn schema() -> &'static ModelSchema {
            user_schema()
        }
    }

    fn row(id: &str, username: &str) -> HashMap<String, Value> {
        let now = Value::Timestamp(OffsetDateTime::now_utc());
        HashMap::from([
            ("id".to_string(), Value::Text(id.to_string())),
            ("username".to_string(), Value::Text(username.to_string())),
            ("createdOn".to_string(), now.clone()),
            ("updatedOn".to_string(), now),
        ])
    }

    #[test]
    fn identity_map_returns_the_same_instance_for_repeat_loads() {
        let store = Store::new();
        let a = store.load::<User>(row("1", "Irakliy"), false, false).unwrap().unwrap();
        let b = store.load::<User>(row("1", "Irakliy"), false, false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn mutable_fetch_promotes_a_previously_non_mutable_model() {
        let store = Store::new();
        let a = store.load::<User>(row("1", "Irakliy"), false, false).unwrap().unwrap();
        assert!(!a.is_mutable());
        let b = store.load::<User>(row("1", "Irakliy"), true, false).unwrap().unwrap();
        assert!(a.is_mutable());
        assert!(b.is_mutable());
    }

    #[test]
    fn reloading_a_modified_mutable_model_fails() {
        let store = Store::new();
        let a = store.load::<User>(row("1", "Irakliy"), true, false).unwrap().unwrap();
        a.set("username", Value::Text("modified".into())).unwrap();
        let err = store.load::<User>(row("1", "Irakliy"), true, false).unwrap_err();
        assert!(err.to_string().contains("modified"));
    }

    #[test]
    fn deleted_model_drops_subsequent_loads_silently() {
        let store = Store::new();
        let a = store.load::<User>(row("1", "Irakliy"), true, false).unwrap().unwrap();
        store.delete(&a).unwrap();
        let again = store.load::<User>(row("1", "Irakliy"), false, false).unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn deleting_an_absent_model_is_a_model_error() {
        let store = Store::new();
        let ghost = store.insert_created::<User>(row("9", "ghost")).unwrap();
        store.delete(&ghost).unwrap();
        // flush would remove it from the map; deleting again afterwards must fail.
        let mut entries = store.entries.lock().unwrap();
        entries.clear();
        drop(entries);
        assert!(store.delete(&ghost).is_err());
    }

    #[test]
    fn readonly_field_rejects_mutation() {
        let store = Store::new();
        let a = store.load::<User>(row("1", "Irakliy"), true, false).unwrap().unwrap();
        assert!(a.set("id", Value::Text("2".into())).is_err());
    }

    #[test]
    fn non_mutable_model_rejects_mutation() {
        let store = Store::new();
        let a = store.load::<User>(row("1", "Irakliy"), false, false).unwrap().unwrap();
        assert!(a.set("username", Value::Text("x".into())).is_err());
    }

    #[test]
    fn has_changed_detects_a_dirty_field_and_flush_clears_it() {
        let store = Store::new();
        let a = store.load::<User>(row("1", "Irakliy"), true, false).unwrap().unwrap();
        assert!(!a.has_changed());
        a.set("username", Value::Text("updated".into())).unwrap();
        assert!(a.has_changed());
        let queries = store.sync_queries(OffsetDateTime::now_utc()).unwrap();
        assert_eq!(queries.len(), 1);
        store.rebaseline(false);
        assert!(!a.has_changed());
    }

    #[test]
    fn created_model_emits_an_insert_and_clears_created_after_flush() {
        let store = Store::new();
        let m = store.insert_created::<User>(row("2", "new")).unwrap();
        assert!(m.is_created());
        let queries = store.sync_queries(OffsetDateTime::now_utc()).unwrap();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].0.starts_with("INSERT INTO users"));
        store.rebaseline(false);
        assert!(!m.is_created());
    }

    #[test]
    fn deleted_model_emits_delete_and_is_removed_after_flush() {
        let store = Store::new();
        let m = store.insert_created::<User>(row("3", "gone")).unwrap();
        store.rebaseline(false);
        store.delete(&m).unwrap();
        let queries = store.sync_queries(OffsetDateTime::now_utc()).unwrap();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].0.starts_with("DELETE FROM users"));
        store.rebaseline(false);
        assert!(store.get_one::<User>("3").is_none());
    }

    #[test]
    fn idempotent_flush_emits_nothing_the_second_time() {
        let store = Store::new();
        let m = store.load::<User>(row("1", "Irakliy"), true, false).unwrap().unwrap();
        m.set("username", Value::Text("updated".into())).unwrap();
        assert_eq!(store.sync_queries(OffsetDateTime::now_utc()).unwrap().len(), 1);
        store.rebaseline(false);
        assert_eq!(store.sync_queries(OffsetDateTime::now_utc()).unwrap().len(), 0);
    }
}

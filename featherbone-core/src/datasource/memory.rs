//! In-memory backend.
//!
//! Records live in tables named after the spinal-cased feather
//! (`/data/sales-order/{id}`). Collection paths are routed to a table with
//! [`MemoryDataSource::with_collection`]. Every write bumps the record etag,
//! and PATCH/DELETE carrying a stale etag are refused with 409.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;
use serde_json::{Map, Value};

use super::{DataSource, DataSourceError, Method, Request};
use crate::defaults::create_id;

type Record = Map<String, Value>;

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, IndexMap<String, Record>>,
    collections: HashMap<String, String>,
    requests: Vec<Request>,
    failures: VecDeque<DataSourceError>,
    version: u64,
}

impl Store {
    fn next_etag(&mut self) -> String {
        self.version += 1;
        format!("v{}", self.version)
    }

    fn handle(&mut self, request: &Request) -> Result<Value, DataSourceError> {
        let rest = request.path.strip_prefix("/data/").ok_or_else(|| {
            DataSourceError::status(DataSourceError::NOT_FOUND, format!("no route {}", request.path))
        })?;
        let (name, id) = match rest.split_once('/') {
            Some((name, id)) => (name, Some(id)),
            None => (rest, None),
        };

        match (request.method, id) {
            (Method::Get | Method::Post, None) if self.collections.contains_key(name) => {
                Ok(self.list(name, request.data.as_ref()))
            }
            (Method::Get, Some(id)) => self
                .tables
                .get(name)
                .and_then(|table| table.get(id))
                .map(|record| Value::Object(record.clone()))
                .ok_or_else(|| not_found(name, id)),
            (Method::Post, None) => self.create(name, request.data.as_ref()),
            (Method::Patch, Some(id)) => self.patch(name, id, request),
            (Method::Delete, Some(id)) => {
                self.current(name, id, request.etag.as_deref())?;
                if let Some(table) = self.tables.get_mut(name) {
                    table.shift_remove(id);
                }
                Ok(Value::Bool(true))
            }
            (method, _) => Err(DataSourceError::status(
                405,
                format!("{} not allowed on {}", method, request.path),
            )),
        }
    }

    fn list(&self, collection: &str, data: Option<&Value>) -> Value {
        let show_deleted = data
            .and_then(|d| d.get("showDeleted"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let records = self
            .collections
            .get(collection)
            .and_then(|table| self.tables.get(table))
            .map(|table| {
                table
                    .values()
                    .filter(|r| show_deleted || r.get("isDeleted") != Some(&Value::Bool(true)))
                    .map(|r| Value::Object(r.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Value::Array(records)
    }

    fn create(&mut self, table: &str, data: Option<&Value>) -> Result<Value, DataSourceError> {
        let mut record = match data {
            Some(Value::Object(record)) => record.clone(),
            _ => return Err(DataSourceError::status(400, "record body must be an object")),
        };
        let id = match record.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => create_id(),
        };
        if self.tables.get(table).is_some_and(|t| t.contains_key(&id)) {
            return Err(DataSourceError::status(
                DataSourceError::CONFLICT,
                format!("{table} {id} already exists"),
            ));
        }

        let etag = self.next_etag();
        record.insert("id".to_string(), Value::String(id.clone()));
        record.insert("etag".to_string(), Value::String(etag));
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(id, record.clone());
        Ok(Value::Object(record))
    }

    fn patch(&mut self, table: &str, id: &str, request: &Request) -> Result<Value, DataSourceError> {
        self.current(table, id, request.etag.as_deref())?;
        let ops = match &request.data {
            Some(Value::Array(ops)) => ops.clone(),
            _ => return Err(DataSourceError::status(400, "patch body must be an array")),
        };

        let etag = self.next_etag();
        let record = self
            .tables
            .get_mut(table)
            .and_then(|t| t.get_mut(id))
            .ok_or_else(|| not_found(table, id))?;
        for op in ops {
            let key = op
                .get("path")
                .and_then(Value::as_str)
                .map(|p| p.trim_start_matches('/').to_string())
                .unwrap_or_default();
            match op.get("op").and_then(Value::as_str) {
                Some("replace" | "add") => {
                    record.insert(key, op.get("value").cloned().unwrap_or(Value::Null));
                }
                Some("remove") => {
                    record.remove(&key);
                }
                other => {
                    return Err(DataSourceError::status(
                        400,
                        format!("unsupported patch op {other:?}"),
                    ))
                }
            }
        }
        record.insert("etag".to_string(), Value::String(etag));
        Ok(Value::Object(record.clone()))
    }

    /// Look up a record and enforce the caller's etag.
    fn current(&self, table: &str, id: &str, etag: Option<&str>) -> Result<&Record, DataSourceError> {
        let record = self
            .tables
            .get(table)
            .and_then(|t| t.get(id))
            .ok_or_else(|| not_found(table, id))?;
        if let Some(etag) = etag {
            if record.get("etag").and_then(Value::as_str) != Some(etag) {
                return Err(DataSourceError::status(
                    DataSourceError::CONFLICT,
                    format!("{table} {id} was changed by another user"),
                ));
            }
        }
        Ok(record)
    }
}

fn not_found(table: &str, id: &str) -> DataSourceError {
    DataSourceError::status(DataSourceError::NOT_FOUND, format!("{table} {id} not found"))
}

#[derive(Debug, Default)]
pub struct MemoryDataSource {
    store: RefCell<Store>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve collection requests on `/data/{collection}` from `table`.
    pub fn with_collection(self, collection: &str, table: &str) -> Self {
        self.store
            .borrow_mut()
            .collections
            .insert(collection.to_string(), table.to_string());
        self
    }

    /// Seed a record, assigning an id and etag. Returns the stored record.
    pub fn insert(&self, table: &str, record: Value) -> Result<Value, DataSourceError> {
        self.store.borrow_mut().create(table, Some(&record))
    }

    pub fn record(&self, table: &str, id: &str) -> Option<Value> {
        self.store
            .borrow()
            .tables
            .get(table)
            .and_then(|t| t.get(id))
            .map(|r| Value::Object(r.clone()))
    }

    /// Apply an edit as another client would, bumping the etag.
    pub fn touch(&self, table: &str, id: &str, changes: Value) -> Option<Value> {
        let mut store = self.store.borrow_mut();
        let etag = store.next_etag();
        let record = store.tables.get_mut(table)?.get_mut(id)?;
        if let Value::Object(changes) = changes {
            record.extend(changes);
        }
        record.insert("etag".to_string(), Value::String(etag));
        Some(Value::Object(record.clone()))
    }

    /// Make the next request fail with `error` before reaching the store.
    pub fn fail_next(&self, error: DataSourceError) {
        self.store.borrow_mut().failures.push_back(error);
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.store.borrow().requests.clone()
    }
}

impl DataSource for MemoryDataSource {
    async fn request(&self, request: Request) -> Result<Value, DataSourceError> {
        let mut store = self.store.borrow_mut();
        store.requests.push(request.clone());
        if let Some(error) = store.failures.pop_front() {
            return Err(error);
        }
        store.handle(&request)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::block_on;

    use super::*;

    fn contacts() -> MemoryDataSource {
        MemoryDataSource::new().with_collection("contacts", "contact")
    }

    #[test]
    fn creates_and_reads_records() {
        let ds = contacts();
        let created = block_on(ds.request(Request::post("/data/contact", json!({"first": "Ann"}))))
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["etag"], json!("v1"));

        let fetched = block_on(ds.request(Request::get(format!("/data/contact/{id}")))).unwrap();
        assert_eq!(fetched["first"], json!("Ann"));
    }

    #[test]
    fn stale_etag_is_a_conflict() {
        let ds = contacts();
        let record = ds.insert("contact", json!({"id": "c1", "first": "Ann"})).unwrap();
        ds.touch("contact", "c1", json!({"first": "Bea"}));

        let patch = Request::patch(
            "/data/contact/c1",
            json!([{"op": "replace", "path": "/first", "value": "Cat"}]),
        )
        .with_etag(record["etag"].as_str().map(String::from));
        let err = block_on(ds.request(patch)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(ds.record("contact", "c1").unwrap()["first"], json!("Bea"));
    }

    #[test]
    fn lists_hide_deleted_records_unless_asked() {
        let ds = contacts();
        ds.insert("contact", json!({"id": "a"})).unwrap();
        ds.insert("contact", json!({"id": "b", "isDeleted": true})).unwrap();

        let visible = block_on(ds.request(Request::get("/data/contacts"))).unwrap();
        assert_eq!(visible.as_array().map(Vec::len), Some(1));

        let all = block_on(ds.request(Request::post("/data/contacts", json!({"showDeleted": true}))))
            .unwrap();
        assert_eq!(all.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn injected_failures_are_logged() {
        let ds = contacts();
        ds.fail_next(DataSourceError::Transport("offline".into()));

        let err = block_on(ds.request(Request::get("/data/contact/x"))).unwrap_err();
        assert_eq!(err, DataSourceError::Transport("offline".into()));
        assert_eq!(ds.requests().len(), 1);
        assert!(block_on(ds.request(Request::delete("/data/contact/x"))).is_err());
    }
}

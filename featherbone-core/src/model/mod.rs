//! Model instances: one record of a feather.
//!
//! A [`ModelInstance`] owns one [`PropertyCell`] per effective property of its
//! feather and a lifecycle machine (see the `states` module) that decides
//! which network operations are allowed. Property writes bubble into the
//! lifecycle through [`ChangeBubbler`], which is how `clean` becomes `dirty`.
//!
//! Network operations run in two phases so that no borrow is held while a
//! request is in flight:
//!
//! 1. `begin_fetch` / `begin_save` / `begin_delete` move the instance into
//!    `/busy` and hand back the [`Request`] to send. `None` means the current
//!    state does not accept the command and nothing happened.
//! 2. [`ModelInstance::complete`] absorbs the response and leaves `/busy`.
//!
//! [`Model`] is the shared handle that strings both phases together.

mod bubble;
mod handle;
mod list;
mod states;

pub use bubble::ChangeBubbler;
pub use handle::Model;
pub use list::ModelList;

pub(crate) use states::{CLEAN, DELETED, SAVING};

use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::datasource::{DataSourceError, Request};
use crate::defaults::DefaultFactories;
use crate::error::ModelError;
use crate::feather::{DefaultValue, Feather};
use crate::property::{Assignment, CellSlot, CellState, PropertyCell};
use crate::state::{StateMachine, Transition};

/// Network operation an instance is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Fetching,
    Posting,
    Patching,
    Deleting,
}

/// The property cells of one instance. Lifecycle hooks receive this.
#[derive(Debug)]
pub struct Properties {
    feather: Rc<Feather>,
    cells: IndexMap<String, PropertyCell>,
}

impl Properties {
    pub fn feather(&self) -> &Feather {
        &self.feather
    }

    pub fn get(&self, name: &str) -> Option<&PropertyCell> {
        self.cells.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PropertyCell> {
        self.cells.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyCell)> {
        self.cells.iter().map(|(name, cell)| (name.as_str(), cell))
    }

    /// Deliver a cell event to every property.
    pub fn broadcast(&mut self, event: &str) {
        for cell in self.cells.values_mut() {
            cell.send(event);
        }
    }

    fn values(&self) -> Map<String, Value> {
        self.cells
            .iter()
            .map(|(name, cell)| (name.clone(), cell.value().clone()))
            .collect()
    }
}

#[derive(Debug)]
pub struct ModelInstance {
    machine: StateMachine<Properties>,
    props: Properties,
    /// Values as last confirmed by the backend; PATCH bodies diff against it.
    snapshot: Map<String, Value>,
    /// Values carried by the save in flight.
    sent: Option<Map<String, Value>>,
    last_error: Option<String>,
}

impl ModelInstance {
    /// A fresh, unsaved instance in `/ready/new`.
    ///
    /// Factory defaults (`createId()`, `now()`, ...) are evaluated here and
    /// never again.
    pub fn new(feather: Rc<Feather>, factories: &DefaultFactories) -> Self {
        let mut cells = IndexMap::with_capacity(feather.properties.len());
        for property in feather.properties.values() {
            let value = match &property.default {
                DefaultValue::Literal(value) => value.clone(),
                DefaultValue::Factory(name) => factories.produce(name).unwrap_or_else(|| {
                    warn!(feather = %feather.name, property = %property.name, factory = %name, "default factory missing");
                    Value::Null
                }),
            };
            let mut cell = PropertyCell::new(&property.name, value)
                .read_only(property.is_read_only)
                .required(property.is_required);
            ChangeBubbler::wire(&mut cell);
            cells.insert(property.name.clone(), cell);
        }

        let mut props = Properties { feather, cells };
        let mut machine =
            StateMachine::define(states::lifecycle()).expect("model lifecycle tree is static");
        machine.start(&mut props);

        Self {
            machine,
            props,
            snapshot: Map::new(),
            sent: None,
            last_error: None,
        }
    }

    /// A new instance with some initial values, applied silently.
    pub fn with_data(feather: Rc<Feather>, factories: &DefaultFactories, data: &Value) -> Self {
        let mut instance = Self::new(feather, factories);
        instance.set(data, true);
        instance
    }

    /// An instance mirroring a record the backend already returned.
    pub fn from_fetched(feather: Rc<Feather>, factories: &DefaultFactories, data: &Value) -> Self {
        let mut instance = Self::with_data(feather, factories, data);
        instance.snapshot = instance.props.values();
        instance.machine.goto(&mut instance.props, CLEAN);
        instance
    }

    pub fn feather(&self) -> &Rc<Feather> {
        &self.props.feather
    }

    pub fn properties(&self) -> &Properties {
        &self.props
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.props.cells.get(name).map(PropertyCell::value)
    }

    pub fn id(&self) -> Option<&str> {
        self.value("id").and_then(Value::as_str)
    }

    pub fn etag(&self) -> Option<&str> {
        self.value("etag").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.props.values())
    }

    /// First active leaf of the lifecycle, e.g. `/ready/fetched/dirty`.
    pub fn state(&self) -> String {
        self.machine.current().into_iter().next().unwrap_or_default()
    }

    pub fn is_in(&self, path: &str) -> bool {
        self.machine.is_in(path)
    }

    pub fn can_handle(&self, event: &str) -> bool {
        self.machine.can_handle(event)
    }

    pub fn state_machine(&self) -> &StateMachine<Properties> {
        &self.machine
    }

    /// For attaching hooks to lifecycle states after construction.
    pub fn state_machine_mut(&mut self) -> &mut StateMachine<Properties> {
        &mut self.machine
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn operation(&self) -> Option<Operation> {
        if self.machine.is_in(states::FETCHING) {
            Some(Operation::Fetching)
        } else if self.machine.is_in(states::POSTING) {
            Some(Operation::Posting)
        } else if self.machine.is_in(states::PATCHING) {
            Some(Operation::Patching)
        } else if self.machine.is_in(states::DELETING) {
            Some(Operation::Deleting)
        } else {
            None
        }
    }

    /// Deliver a lifecycle event. Unhandled events change nothing.
    pub fn send(&mut self, event: &str) -> Transition {
        let outcome = self.machine.send(&mut self.props, event);
        if !outcome.is_handled() {
            debug!(feather = %self.props.feather.name, event, state = %self.state(), "event dropped");
        }
        outcome
    }

    /// Deliver a cell event (`disable`, `enable`, ...) to every property.
    pub fn send_to_properties(&mut self, event: &str) {
        self.props.broadcast(event);
        ChangeBubbler::flush(&mut self.machine, &mut self.props);
    }

    /// Write one property through its cell.
    ///
    /// Read-only properties refuse the write and record `last_error`.
    pub fn set_value(&mut self, name: &str, value: Value) -> Result<Assignment, ModelError> {
        let read_only = match self.props.cells.get(name) {
            Some(cell) => cell.is_read_only(),
            None => {
                return Err(self.reject(ModelError::UnknownProperty {
                    feather: self.props.feather.name.clone(),
                    property: name.to_string(),
                }))
            }
        };
        if read_only {
            return Err(self.reject(ModelError::ReadOnly(name.to_string())));
        }

        let assignment = match self.props.cells.get_mut(name) {
            Some(cell) => cell.set(value),
            None => Assignment::Ignored,
        };
        ChangeBubbler::flush(&mut self.machine, &mut self.props);
        Ok(assignment)
    }

    /// Bulk assignment from a JSON object; keys that are not properties are
    /// skipped.
    ///
    /// A silent set puts every cell into `silent` first and reports them
    /// back afterwards, so nothing bubbles and the lifecycle does not move.
    /// Disabled cells accept a silent set and are disabled again after it.
    /// A loud set refuses read-only properties. Returns the number of
    /// properties written.
    pub fn set(&mut self, data: &Value, silent: bool) -> usize {
        let Some(data) = data.as_object() else {
            warn!(feather = %self.props.feather.name, "ignoring non-object data");
            return 0;
        };

        let mut disabled = Vec::new();
        if silent {
            for (name, cell) in self.props.cells.iter_mut() {
                if cell.state() == CellState::Disabled {
                    cell.send("enable");
                    disabled.push(name.clone());
                }
                cell.send("silence");
            }
        }

        let mut written = 0;
        let mut refused = Vec::new();
        for (key, value) in data {
            let Some(cell) = self.props.cells.get_mut(key) else {
                continue;
            };
            if !silent && cell.is_read_only() {
                refused.push(key.clone());
                continue;
            }
            if matches!(cell.set(value.clone()), Assignment::Changed | Assignment::Silent) {
                written += 1;
            }
        }

        if silent {
            self.props.broadcast("report");
            for name in disabled {
                if let Some(cell) = self.props.cells.get_mut(&name) {
                    cell.send("disable");
                }
            }
        }
        for key in refused {
            self.reject(ModelError::ReadOnly(key));
        }

        ChangeBubbler::flush(&mut self.machine, &mut self.props);
        written
    }

    /// Run `hook` before `name` swaps in a new value.
    pub fn on_change(
        &mut self,
        name: &str,
        hook: impl Fn(&mut CellSlot) + 'static,
    ) -> Result<(), ModelError> {
        self.cell_mut(name)?.on_change(hook);
        Ok(())
    }

    /// Run `hook` after `name` swapped in a new value.
    pub fn on_changed(
        &mut self,
        name: &str,
        hook: impl Fn(&mut CellSlot) + 'static,
    ) -> Result<(), ModelError> {
        self.cell_mut(name)?.on_changed(hook);
        Ok(())
    }

    /// Required properties must be neither null nor empty.
    pub fn is_valid(&mut self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&mut self) -> Result<(), ModelError> {
        let missing = self
            .props
            .cells
            .values()
            .find(|cell| cell.is_required() && is_blank(cell.value()))
            .map(|cell| cell.name().to_string());
        match missing {
            Some(name) => Err(self.reject(ModelError::Validation(format!(
                "{}.{} is required",
                self.props.feather.name, name
            )))),
            None => {
                self.last_error = None;
                Ok(())
            }
        }
    }

    /// Mark the record as locked by someone else and freeze its properties.
    pub fn lock(&mut self, info: Value) -> Transition {
        self.set(&json!({ "lock": info }), true);
        self.send("lock")
    }

    /// Release a lock. Edits made before the lock was taken leave the record
    /// dirty again.
    pub fn unlock(&mut self) -> Transition {
        let outcome = self.send("unlock");
        self.set(&json!({ "lock": null }), true);
        self.resync();
        outcome
    }

    /// Start a GET of this record.
    pub fn begin_fetch(&mut self) -> Option<Request> {
        let Some(id) = self.id().map(str::to_string) else {
            self.reject(ModelError::Malformed("cannot fetch a record without id".into()));
            return None;
        };
        if !self.send("fetch").is_moved() {
            return None;
        }
        Some(Request::get(format!(
            "{}/{}",
            self.props.feather.record_path(),
            id
        )))
    }

    /// Start a POST (new) or PATCH (dirty) of this record.
    ///
    /// Invalid instances fail without leaving their state.
    pub fn begin_save(&mut self) -> Result<Option<Request>, ModelError> {
        if !self.can_handle("save") {
            debug!(feather = %self.props.feather.name, state = %self.state(), "save dropped");
            return Ok(None);
        }
        self.validate()?;
        if !self.send("save").is_moved() {
            return Ok(None);
        }

        let path = self.props.feather.record_path();
        let request = match self.operation() {
            Some(Operation::Posting) => Some(Request::post(path, self.to_json())),
            Some(Operation::Patching) => Some(
                Request::patch(
                    format!("{}/{}", path, self.id().unwrap_or_default()),
                    Value::Array(self.patch_ops()),
                )
                .with_etag(self.etag().map(String::from)),
            ),
            _ => None,
        };
        if request.is_some() {
            self.sent = Some(self.props.values());
        }
        Ok(request)
    }

    /// Start a DELETE. Unsaved instances are deleted locally and yield no
    /// request.
    pub fn begin_delete(&mut self) -> Option<Request> {
        if !self.send("delete").is_moved() || self.is_in(DELETED) {
            return None;
        }
        Some(
            Request::delete(format!(
                "{}/{}",
                self.props.feather.record_path(),
                self.id().unwrap_or_default()
            ))
            .with_etag(self.etag().map(String::from)),
        )
    }

    /// Absorb the outcome of the request started by a `begin_*` call.
    ///
    /// A conflict on save returns to the originating state and leaves the
    /// local edits in place. Any other failure is terminal. Completions
    /// arriving outside `/busy` are ignored.
    pub fn complete(&mut self, result: Result<Value, DataSourceError>) -> Result<(), ModelError> {
        let Some(operation) = self.operation() else {
            debug!(feather = %self.props.feather.name, state = %self.state(), "late completion ignored");
            return Ok(());
        };
        let sent = self.sent.take();

        match result {
            Ok(_) if operation == Operation::Deleting => {
                self.send("deleted");
                Ok(())
            }
            Ok(body) => {
                self.absorb(body, sent);
                self.send("fetched");
                self.resync();
                Ok(())
            }
            Err(err) if err.is_conflict() && operation != Operation::Fetching => {
                let err = self.reject(ModelError::Conflict(err.to_string()));
                self.send("conflict");
                Err(err)
            }
            Err(err) => {
                error!(
                    feather = %self.props.feather.name,
                    id = self.id().unwrap_or_default(),
                    ?operation,
                    %err,
                    "request failed"
                );
                self.last_error = Some(err.to_string());
                self.send("error");
                Err(ModelError::DataSource(err))
            }
        }
    }

    /// Apply a server response silently: a full record, or a list of
    /// JSON-Patch operations on top-level properties.
    ///
    /// After a save the confirmed values are the ones `sent` plus whatever
    /// the response carried, so edits made while the request was in flight
    /// stay unconfirmed.
    fn absorb(&mut self, body: Value, sent: Option<Map<String, Value>>) {
        let data = match body {
            Value::Object(_) => body,
            Value::Array(ops) => Value::Object(
                ops.iter()
                    .filter(|op| matches!(op.get("op").and_then(Value::as_str), Some("replace" | "add")))
                    .filter_map(|op| {
                        let key = op.get("path")?.as_str()?.strip_prefix('/')?;
                        (!key.contains('/'))
                            .then(|| (key.to_string(), op.get("value").cloned().unwrap_or(Value::Null)))
                    })
                    .collect(),
            ),
            _ => Value::Object(Map::new()),
        };
        self.set(&data, true);
        let base = sent.unwrap_or_else(|| self.props.values());
        self.snapshot = self.confirm(base, &data);
    }

    /// Apply values pushed by the server silently and count them as
    /// confirmed. Local edits to other properties stay unsaved.
    pub fn apply_remote(&mut self, data: &Value) -> usize {
        let written = self.set(data, true);
        let base = std::mem::take(&mut self.snapshot);
        self.snapshot = self.confirm(base, data);
        written
    }

    /// `base` with the current value of every property named in `data`.
    fn confirm(&self, mut base: Map<String, Value>, data: &Value) -> Map<String, Value> {
        for key in data.as_object().into_iter().flat_map(Map::keys) {
            if let Some(cell) = self.props.cells.get(key) {
                base.insert(key.clone(), cell.value().clone());
            }
        }
        base
    }

    /// A clean record whose values differ from the confirmed ones is dirty.
    fn resync(&mut self) {
        if self.machine.is_in(CLEAN) && !self.patch_ops().is_empty() {
            self.send("changed");
        }
    }

    /// `replace` operations for writable properties that differ from the
    /// last confirmed values.
    fn patch_ops(&self) -> Vec<Value> {
        self.props
            .cells
            .iter()
            .filter(|(_, cell)| !cell.is_read_only())
            .filter(|(name, cell)| self.snapshot.get(name.as_str()) != Some(cell.value()))
            .map(|(name, cell)| json!({ "op": "replace", "path": format!("/{name}"), "value": cell.value() }))
            .collect()
    }

    fn cell_mut(&mut self, name: &str) -> Result<&mut PropertyCell, ModelError> {
        let feather = self.props.feather.name.clone();
        self.props
            .cells
            .get_mut(name)
            .ok_or_else(|| ModelError::UnknownProperty {
                feather,
                property: name.to_string(),
            })
    }

    fn reject(&mut self, err: ModelError) -> ModelError {
        warn!(feather = %self.props.feather.name, %err, "rejected");
        self.last_error = Some(err.to_string());
        err
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

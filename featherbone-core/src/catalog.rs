//! Registry of feathers and live collections.
//!
//! One [`Catalog`] is created per session and passed by reference to whatever
//! needs lookups. It is populated from the schema payload at startup and
//! mutated afterwards by push events. Its namespaces:
//!
//! - feathers: resolved schemas, see [`Catalog::get_feather`]
//! - models: a factory per feather, see [`Catalog::create`] and
//!   [`Catalog::list`]; an unknown name is [`ModelError::UnknownFeather`]
//! - data: named collections
//! - subscriptions: collections keyed by push subscription id
//! - workbooks: named standalone models
//!
//! Entries may be replaced by a push event at any time, so callers re-read
//! after an `.await` instead of holding on to them.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info};

use crate::defaults::DefaultFactories;
use crate::error::{ModelError, SchemaError};
use crate::feather::{object_spec, resolve_all, Feather, FeatherSpec, ROOT_FEATHER};
use crate::model::{Model, ModelList};

#[derive(Debug)]
pub struct Catalog {
    specs: IndexMap<String, FeatherSpec>,
    feathers: IndexMap<String, Rc<Feather>>,
    factories: DefaultFactories,
    data: HashMap<String, ModelList>,
    subscriptions: HashMap<String, ModelList>,
    workbooks: HashMap<String, Model>,
    event_key: Option<String>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    /// A catalog holding only the root feather, with the built-in default
    /// factories.
    pub fn new() -> Self {
        Self::with_factories(DefaultFactories::builtin())
    }

    pub fn with_factories(factories: DefaultFactories) -> Self {
        let mut catalog = Self {
            specs: IndexMap::new(),
            feathers: IndexMap::new(),
            factories,
            data: HashMap::new(),
            subscriptions: HashMap::new(),
            workbooks: HashMap::new(),
            event_key: None,
        };
        // The root feather alone always resolves.
        if let Err(err) = catalog.load_specs(IndexMap::new()) {
            tracing::error!(%err, "root feather failed to resolve");
        }
        catalog
    }

    /// Replace the feather set with a schema payload (`name -> definition`).
    ///
    /// The payload is validated as a whole; on error the catalog keeps its
    /// previous feathers. Returns the number of feathers loaded.
    pub fn load(&mut self, payload: Value) -> Result<usize, SchemaError> {
        let specs: IndexMap<String, FeatherSpec> =
            serde_json::from_value(payload).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        self.load_specs(specs)
    }

    pub fn load_specs(&mut self, specs: IndexMap<String, FeatherSpec>) -> Result<usize, SchemaError> {
        self.replace(specs)?;
        info!(feathers = self.feathers.len(), "catalog loaded");
        Ok(self.feathers.len())
    }

    fn replace(&mut self, mut specs: IndexMap<String, FeatherSpec>) -> Result<(), SchemaError> {
        if !specs.contains_key(ROOT_FEATHER) {
            specs.shift_insert(0, ROOT_FEATHER.to_string(), object_spec());
        }
        let resolved = resolve_all(&specs, &self.factories)?;
        self.feathers = resolved
            .into_iter()
            .map(|(name, feather)| (name, Rc::new(feather)))
            .collect();
        self.specs = specs;
        Ok(())
    }

    pub fn get_feather(&self, name: &str) -> Option<Rc<Feather>> {
        self.feathers.get(name).cloned()
    }

    pub fn feather_names(&self) -> impl Iterator<Item = &str> {
        self.feathers.keys().map(String::as_str)
    }

    pub fn feathers(&self) -> impl Iterator<Item = &Rc<Feather>> {
        self.feathers.values()
    }

    /// Every feather descending from `name`.
    pub fn children_of(&self, name: &str) -> Vec<Rc<Feather>> {
        self.feathers
            .get(name)
            .map(|feather| {
                feather
                    .children
                    .iter()
                    .filter_map(|child| self.feathers.get(child).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Add or redefine one feather, re-resolving the whole set.
    pub fn register_feather(
        &mut self,
        name: impl Into<String>,
        spec: FeatherSpec,
    ) -> Result<Rc<Feather>, SchemaError> {
        let name = name.into();
        let mut specs = self.specs.clone();
        specs.insert(name.clone(), spec);
        self.replace(specs)?;
        debug!(feather = %name, "feather registered");
        self.get_feather(&name)
            .ok_or(SchemaError::UnknownFeather(name))
    }

    /// Remove a feather nobody inherits from.
    pub fn unregister_feather(&mut self, name: &str) -> Result<(), SchemaError> {
        let feather = self
            .feathers
            .get(name)
            .ok_or_else(|| SchemaError::UnknownFeather(name.to_string()))?;
        if name == ROOT_FEATHER || !feather.children.is_empty() {
            return Err(SchemaError::InUse {
                feather: name.to_string(),
                children: feather.children.clone(),
            });
        }

        let mut specs = self.specs.clone();
        specs.shift_remove(name);
        self.replace(specs)?;
        debug!(feather = %name, "feather removed");
        Ok(())
    }

    pub fn factories(&self) -> &DefaultFactories {
        &self.factories
    }

    /// A new, unsaved model of feather `name`.
    pub fn create(&self, name: &str) -> Result<Model, ModelError> {
        let feather = self
            .get_feather(name)
            .ok_or_else(|| ModelError::UnknownFeather(name.to_string()))?;
        Ok(Model::create(feather, &self.factories))
    }

    /// A new collection of feather `name`, not yet fetched.
    pub fn list(&self, name: &str) -> Result<ModelList, ModelError> {
        let feather = self
            .get_feather(name)
            .ok_or_else(|| ModelError::UnknownFeather(name.to_string()))?;
        Ok(ModelList::new(feather))
    }

    pub fn register_data(&mut self, name: impl Into<String>, list: ModelList) -> Option<ModelList> {
        self.data.insert(name.into(), list)
    }

    pub fn data(&self, name: &str) -> Option<ModelList> {
        self.data.get(name).cloned()
    }

    pub fn unregister_data(&mut self, name: &str) -> Option<ModelList> {
        self.data.remove(name)
    }

    pub fn register_subscription(&mut self, id: impl Into<String>, list: ModelList) -> Option<ModelList> {
        self.subscriptions.insert(id.into(), list)
    }

    pub fn subscription(&self, id: &str) -> Option<ModelList> {
        self.subscriptions.get(id).cloned()
    }

    pub fn unregister_subscription(&mut self, id: &str) -> Option<ModelList> {
        self.subscriptions.remove(id)
    }

    pub fn register_workbook(&mut self, name: impl Into<String>, model: Model) -> Option<Model> {
        self.workbooks.insert(name.into(), model)
    }

    pub fn workbook(&self, name: &str) -> Option<Model> {
        self.workbooks.get(name).cloned()
    }

    pub fn unregister_workbook(&mut self, name: &str) -> Option<Model> {
        self.workbooks.remove(name)
    }

    /// Key identifying this session's push feed.
    pub fn event_key(&self) -> Option<&str> {
        self.event_key.as_deref()
    }

    pub fn set_event_key(&mut self, key: impl Into<String>) {
        self.event_key = Some(key.into());
    }

    /// Drop every registration and go back to the root feather only.
    pub fn teardown(&mut self) {
        self.data.clear();
        self.subscriptions.clear();
        self.workbooks.clear();
        self.event_key = None;
        if let Err(err) = self.replace(IndexMap::new()) {
            tracing::error!(%err, "root feather failed to resolve");
        }
        info!("catalog torn down");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_catalog_knows_the_root_feather() {
        let catalog = Catalog::new();
        let object = catalog.get_feather(ROOT_FEATHER).unwrap();
        assert!(object.property("id").is_some());
        assert!(object.property("etag").unwrap().is_read_only);
        assert!(!object.property("id").unwrap().is_read_only);
    }

    #[test]
    fn failed_load_keeps_previous_feathers() {
        let mut catalog = Catalog::new();
        catalog
            .load(json!({"Contact": {"properties": {"first": {"type": "string"}}}}))
            .unwrap();

        let err = catalog
            .load(json!({"Orphan": {"inherits": "Missing"}}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingAncestor { .. }));
        assert!(catalog.get_feather("Contact").is_some());
        assert!(catalog.get_feather("Orphan").is_none());
    }

    #[test]
    fn create_resolves_factories() {
        let mut catalog = Catalog::new();
        catalog
            .load(json!({"Contact": {"properties": {"first": {"type": "string"}}}}))
            .unwrap();
        let model = catalog.create("Contact").unwrap();
        assert!(model.id().is_some());
        assert!(matches!(catalog.create("Nope"), Err(ModelError::UnknownFeather(_))));
    }

    #[test]
    fn teardown_clears_namespaces() {
        let mut catalog = Catalog::new();
        catalog
            .load(json!({"Contact": {"plural": "Contacts"}}))
            .unwrap();
        let list = catalog.list("Contact").unwrap();
        catalog.register_data("contacts", list.clone());
        catalog.register_subscription("sub-1", list);
        catalog.set_event_key("key");

        catalog.teardown();
        assert!(catalog.data("contacts").is_none());
        assert!(catalog.subscription("sub-1").is_none());
        assert!(catalog.event_key().is_none());
        assert!(catalog.get_feather("Contact").is_none());
        assert!(catalog.get_feather(ROOT_FEATHER).is_some());
    }
}

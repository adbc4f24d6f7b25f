use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value};
use tracing::info;

use super::Model;
use crate::catalog::Catalog;
use crate::datasource::{DataSource, Request};
use crate::defaults::create_id;
use crate::error::ModelError;
use crate::feather::Feather;

#[derive(Debug)]
struct ListState {
    feather: Rc<Feather>,
    models: Vec<Model>,
    show_deleted: bool,
    subscription: Option<String>,
}

/// Shared collection of models of one feather.
///
/// Subscribed lists are registered in the catalog under their subscription
/// id so pushed deltas can find them.
#[derive(Debug, Clone)]
pub struct ModelList(Rc<RefCell<ListState>>);

impl ModelList {
    pub fn new(feather: Rc<Feather>) -> Self {
        Self(Rc::new(RefCell::new(ListState {
            feather,
            models: Vec::new(),
            show_deleted: false,
            subscription: None,
        })))
    }

    /// Keep deleted records in the list, flagged `isDeleted`.
    pub fn with_show_deleted(self, show_deleted: bool) -> Self {
        self.0.borrow_mut().show_deleted = show_deleted;
        self
    }

    pub fn feather(&self) -> Rc<Feather> {
        Rc::clone(&self.0.borrow().feather)
    }

    pub fn show_deleted(&self) -> bool {
        self.0.borrow().show_deleted
    }

    pub fn subscription_id(&self) -> Option<String> {
        self.0.borrow().subscription.clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().models.is_empty()
    }

    /// Handles to every model, in list order.
    pub fn models(&self) -> Vec<Model> {
        self.0.borrow().models.clone()
    }

    pub fn find(&self, id: &str) -> Option<Model> {
        self.0
            .borrow()
            .models
            .iter()
            .find(|model| model.borrow().id() == Some(id))
            .cloned()
    }

    pub fn add(&self, model: Model) {
        self.0.borrow_mut().models.push(model);
    }

    pub fn remove(&self, id: &str) -> Option<Model> {
        let mut state = self.0.borrow_mut();
        let index = state
            .models
            .iter()
            .position(|model| model.borrow().id() == Some(id))?;
        Some(state.models.remove(index))
    }

    /// Replace the contents with the backend's collection.
    ///
    /// With `subscribe`, the request opens a push subscription bound to the
    /// catalog's event key and the list is registered under its id, replacing
    /// any previous subscription of this list.
    pub async fn fetch(
        &self,
        source: &impl DataSource,
        catalog: &mut Catalog,
        subscribe: bool,
    ) -> Result<usize, ModelError> {
        let (feather, show_deleted) = {
            let state = self.0.borrow();
            (Rc::clone(&state.feather), state.show_deleted)
        };
        let path = feather.collection_path().ok_or_else(|| {
            ModelError::Malformed(format!("feather `{}` has no plural name", feather.name))
        })?;

        let subscription = subscribe.then(create_id);
        let request = match &subscription {
            Some(id) => Request::post(
                path,
                json!({
                    "subscription": {"id": id, "eventKey": catalog.event_key()},
                    "showDeleted": show_deleted,
                }),
            ),
            None if show_deleted => Request::post(path, json!({ "showDeleted": true })),
            None => Request::get(path),
        };

        let body = source.request(request).await?;
        let Value::Array(records) = body else {
            return Err(ModelError::Malformed(format!(
                "expected a list of `{}` records",
                feather.name
            )));
        };

        let models: Vec<Model> = records
            .iter()
            .map(|record| Model::from_fetched(Rc::clone(&feather), catalog.factories(), record))
            .collect();
        let count = models.len();

        let previous = {
            let mut state = self.0.borrow_mut();
            state.models = models;
            match subscription.clone() {
                Some(id) => state.subscription.replace(id),
                None => None,
            }
        };
        if let Some(previous) = previous {
            catalog.unregister_subscription(&previous);
        }
        if let Some(id) = subscription {
            info!(feather = %feather.name, subscription = %id, count, "subscribed");
            catalog.register_subscription(id, self.clone());
        }

        Ok(count)
    }
}

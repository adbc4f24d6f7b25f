use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use serde_json::Value;
use tracing::debug;

use super::ModelInstance;
use crate::datasource::DataSource;
use crate::defaults::DefaultFactories;
use crate::error::ModelError;
use crate::feather::Feather;

/// Shared handle to a [`ModelInstance`].
///
/// Collections, subscriptions and callers hold clones of the same handle.
/// The async operations borrow the instance only around the two synchronous
/// phases, never across the request itself, so a push update may land while
/// a save is in flight and observe `/busy`.
#[derive(Debug, Clone)]
pub struct Model(Rc<RefCell<ModelInstance>>);

impl Model {
    pub fn new(instance: ModelInstance) -> Self {
        Self(Rc::new(RefCell::new(instance)))
    }

    pub fn create(feather: Rc<Feather>, factories: &DefaultFactories) -> Self {
        Self::new(ModelInstance::new(feather, factories))
    }

    pub fn from_fetched(feather: Rc<Feather>, factories: &DefaultFactories, data: &Value) -> Self {
        Self::new(ModelInstance::from_fetched(feather, factories, data))
    }

    pub fn borrow(&self) -> Ref<'_, ModelInstance> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, ModelInstance> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &Model) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn id(&self) -> Option<String> {
        self.0.borrow().id().map(String::from)
    }

    pub fn state(&self) -> String {
        self.0.borrow().state()
    }

    /// Reload from the backend. Does nothing unless the lifecycle accepts
    /// `fetch`.
    pub async fn fetch(&self, source: &impl DataSource) -> Result<(), ModelError> {
        let request = self.0.borrow_mut().begin_fetch();
        let Some(request) = request else {
            return Ok(());
        };
        debug!(method = %request.method, path = %request.path, "fetch");
        let result = source.request(request).await;
        self.0.borrow_mut().complete(result)
    }

    /// POST a new record or PATCH a dirty one.
    pub async fn save(&self, source: &impl DataSource) -> Result<(), ModelError> {
        let request = self.0.borrow_mut().begin_save()?;
        let Some(request) = request else {
            return Ok(());
        };
        debug!(method = %request.method, path = %request.path, "save");
        let result = source.request(request).await;
        self.0.borrow_mut().complete(result)
    }

    /// DELETE a fetched record, or discard an unsaved one locally.
    pub async fn delete(&self, source: &impl DataSource) -> Result<(), ModelError> {
        let request = self.0.borrow_mut().begin_delete();
        let Some(request) = request else {
            return Ok(());
        };
        debug!(method = %request.method, path = %request.path, "delete");
        let result = source.request(request).await;
        self.0.borrow_mut().complete(result)
    }
}

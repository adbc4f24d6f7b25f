//! Push updates from the event source.
//!
//! The backend pushes one message per change to a subscribed collection:
//!
//! ```json
//! {"message": {"subscription": {"subscriptionid": "…", "change": "update"},
//!              "data": {"id": "c1", "etag": "v7", "first": "Ann"}}}
//! ```
//!
//! [`SubscriptionChannel::apply`] routes each message to the collection the
//! catalog holds under that subscription id. Remote values always go in
//! through a silent set, so a pushed update never makes a model dirty and
//! never triggers a save of its own.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::feather::FeatherSpec;
use crate::model::{Model, SAVING};
use crate::state::{StateMachine, StateSpec, Transition};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub subscription: SubscriptionInfo,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(rename = "subscriptionid", default)]
    pub subscription_id: String,
    pub change: Change,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Change {
    Create,
    Update,
    Delete,
    Lock,
    Unlock,
    Feather,
    SignedOut,
}

/// What [`SubscriptionChannel::apply`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Created(String),
    Updated(String),
    /// Echo of our own write, or the model is mid-save.
    Skipped(String),
    Deleted(String),
    /// Kept in a `show_deleted` list with `isDeleted` set.
    MarkedDeleted(String),
    Locked(String),
    Unlocked(String),
    FeatherRegistered(String),
    FeatherRemoved(String),
    /// A feather push the catalog refused.
    Rejected(String),
    SignedOut,
    UnknownSubscription(String),
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("push feed transport failed: {0}")]
    Transport(String),

    #[error("push feed closed by the server")]
    Closed,

    #[error("malformed push message: {0}")]
    Malformed(String),
}

/// Source of push messages. `Ok(None)` means the stream ended.
#[allow(async_fn_in_trait)]
pub trait PushFeed {
    async fn next_message(&mut self) -> Result<Option<PushMessage>, FeedError>;
}

/// Global connectivity: `/ok` until the push feed fails, then `/error` for
/// the rest of the session.
#[derive(Debug)]
pub struct Connectivity {
    machine: StateMachine<()>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new()
    }
}

impl Connectivity {
    pub fn new() -> Self {
        let mut machine = StateMachine::define(
            StateSpec::root()
                .child(StateSpec::new("ok").on("error", "/error"))
                .child(StateSpec::new("error").final_state()),
        )
        .expect("connectivity state tree is static");
        machine.start(&mut ());
        Self { machine }
    }

    pub fn error(&mut self) -> Transition {
        self.machine.send(&mut (), "error")
    }

    pub fn is_ok(&self) -> bool {
        self.machine.is_in("/ok")
    }

    pub fn is_error(&self) -> bool {
        self.machine.is_in("/error")
    }

    /// Run `hook` when connectivity is lost.
    pub fn on_error(&mut self, hook: impl Fn() + 'static) {
        if let Some(state) = self.machine.resolve_mut("/error") {
            state.enter(move |_: &mut ()| hook());
        }
    }
}

/// How [`SubscriptionChannel::listen`] stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    SignedOut,
    Closed,
}

#[derive(Debug, Default)]
struct ChannelState {
    closed: Cell<bool>,
    connectivity: RefCell<Connectivity>,
}

/// Feeds push messages into the catalog's subscribed collections.
///
/// Clones share state, so one clone can [`close`](Self::close) the channel
/// another is listening on.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionChannel(Rc<ChannelState>);

impl SubscriptionChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.get()
    }

    /// Stop listening after the current message. In-flight model requests
    /// are not affected.
    pub fn close(&self) {
        self.0.closed.set(true);
    }

    pub fn is_connected(&self) -> bool {
        self.0.connectivity.borrow().is_ok()
    }

    pub fn on_connectivity_lost(&self, hook: impl Fn() + 'static) {
        self.0.connectivity.borrow_mut().on_error(hook);
    }

    /// Drive `feed` until sign-out, close or failure, applying every message.
    ///
    /// A transport failure or an ended stream moves connectivity to
    /// `/error` and is returned.
    pub async fn listen(
        &self,
        feed: &mut impl PushFeed,
        catalog: &mut Catalog,
        mut on_applied: impl FnMut(&Applied),
    ) -> Result<Stopped, FeedError> {
        info!("listening for push updates");
        while !self.is_closed() {
            let message = match feed.next_message().await {
                Ok(Some(message)) => message,
                Ok(None) => return Err(self.lose(FeedError::Closed)),
                Err(err) => return Err(self.lose(err)),
            };
            if self.is_closed() {
                break;
            }

            let applied = Self::apply(catalog, &message);
            on_applied(&applied);
            if applied == Applied::SignedOut {
                self.close();
                return Ok(Stopped::SignedOut);
            }
        }
        Ok(Stopped::Closed)
    }

    fn lose(&self, err: FeedError) -> FeedError {
        error!(%err, "connectivity lost");
        self.0.connectivity.borrow_mut().error();
        err
    }

    /// Apply one message to the catalog.
    pub fn apply(catalog: &mut Catalog, message: &PushMessage) -> Applied {
        let info = &message.subscription;
        let data = &message.data;

        match info.change {
            Change::SignedOut => return Applied::SignedOut,
            Change::Feather => return apply_feather(catalog, data, info.deleted),
            _ => {}
        }

        let Some(list) = catalog.subscription(&info.subscription_id) else {
            debug!(subscription = %info.subscription_id, "message for unknown subscription");
            return Applied::UnknownSubscription(info.subscription_id.clone());
        };
        let Some(id) = record_id(info.change, data) else {
            return Applied::NotFound(String::new());
        };

        if info.change == Change::Create {
            if list.find(&id).is_some() {
                return Applied::Skipped(id);
            }
            list.add(Model::from_fetched(list.feather(), catalog.factories(), data));
            return Applied::Created(id);
        }

        let Some(model) = list.find(&id) else {
            return Applied::NotFound(id);
        };
        let mut instance = model.borrow_mut();

        match info.change {
            Change::Update => {
                if instance.is_in(SAVING) {
                    debug!(%id, "update skipped while saving");
                    return Applied::Skipped(id);
                }
                let etag = data.get("etag").and_then(Value::as_str);
                if etag.is_some() && etag == instance.etag() {
                    debug!(%id, "update echo skipped");
                    return Applied::Skipped(id);
                }
                instance.apply_remote(data);
                Applied::Updated(id)
            }
            Change::Delete if list.show_deleted() => {
                instance.set(&json!({ "isDeleted": true }), true);
                Applied::MarkedDeleted(id)
            }
            Change::Delete => {
                drop(instance);
                list.remove(&id);
                Applied::Deleted(id)
            }
            Change::Lock => {
                instance.lock(data.get("lock").cloned().unwrap_or(Value::Null));
                Applied::Locked(id)
            }
            Change::Unlock => {
                instance.unlock();
                Applied::Unlocked(id)
            }
            Change::Create | Change::Feather | Change::SignedOut => Applied::NotFound(id),
        }
    }
}

/// Id of the record a message is about. Delete and unlock messages carry the
/// bare id; the others carry the record.
fn record_id(change: Change, data: &Value) -> Option<String> {
    let bare = match change {
        Change::Delete | Change::Unlock => data.as_str(),
        _ => None,
    };
    bare.or_else(|| data.get("id").and_then(Value::as_str))
        .map(str::to_string)
}

/// A removed feather arrives as its bare name, a defined one as the full
/// definition named by `name` or `id`.
fn apply_feather(catalog: &mut Catalog, data: &Value, deleted: bool) -> Applied {
    let named = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);

    let outcome = if deleted {
        let Some(name) = data.as_str().map(str::to_string).or_else(|| named("name")) else {
            return Applied::Rejected("feather removal without a name".to_string());
        };
        catalog.unregister_feather(&name).map(|_| Applied::FeatherRemoved(name))
    } else {
        let spec: FeatherSpec = match serde_json::from_value(data.clone()) {
            Ok(spec) => spec,
            Err(err) => return Applied::Rejected(err.to_string()),
        };
        let Some(name) = spec.name.clone().or_else(|| named("id")) else {
            return Applied::Rejected("feather push without a name".to_string());
        };
        catalog
            .register_feather(name.clone(), spec)
            .map(|_| Applied::FeatherRegistered(name))
    };
    outcome.unwrap_or_else(|err| {
        warn!(%err, "feather push refused");
        Applied::Rejected(err.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_push_envelopes() {
        let envelope: PushEnvelope = serde_json::from_value(json!({
            "message": {
                "subscription": {"subscriptionid": "s1", "change": "signedOut"},
                "data": null
            }
        }))
        .unwrap();
        assert_eq!(envelope.message.subscription.change, Change::SignedOut);
        assert_eq!(envelope.message.subscription.subscription_id, "s1");
        assert!(!envelope.message.subscription.deleted);
    }

    #[test]
    fn connectivity_error_is_terminal() {
        let mut connectivity = Connectivity::new();
        let lost = Rc::new(Cell::new(0));
        let counter = Rc::clone(&lost);
        connectivity.on_error(move || counter.set(counter.get() + 1));

        assert!(connectivity.is_ok());
        assert!(connectivity.error().is_moved());
        assert!(!connectivity.error().is_moved());
        assert!(connectivity.is_error());
        assert_eq!(lost.get(), 1);
    }
}

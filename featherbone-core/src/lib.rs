//! Featherbone core: schema-driven model runtime.
//!
//! Feathers (schemas) are loaded into a [`Catalog`]. Models are built from
//! feathers as collections of [`PropertyCell`]s, each cell and each model
//! driven by its own hierarchical [`StateMachine`]. Nothing here performs
//! I/O; requests leave through the [`DataSource`] trait and push updates
//! come in through [`SubscriptionChannel`].

pub mod catalog;
pub mod datasource;
pub mod defaults;
pub mod error;
pub mod feather;
pub mod model;
pub mod property;
pub mod state;
pub mod subscription;

pub use catalog::Catalog;
pub use datasource::{DataSource, DataSourceError, MemoryDataSource, Method, Request};
pub use defaults::DefaultFactories;
pub use error::{ModelError, SchemaError, StateError};
pub use feather::{Feather, FeatherSpec, Property, PropertyType};
pub use model::{ChangeBubbler, Model, ModelInstance, ModelList, Operation};
pub use property::{Assignment, CellState, PropertyCell};
pub use state::{StateMachine, StateSpec, Transition};
pub use subscription::{
    Applied, Change, Connectivity, FeedError, PushEnvelope, PushFeed, PushMessage, Stopped,
    SubscriptionChannel,
};

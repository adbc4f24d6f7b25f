//! Error types for the model runtime.
//!
//! | Error | Raised by | Recovery |
//! |-------|-----------|----------|
//! | [`StateError`] | defining a state tree | fix the definition |
//! | [`SchemaError`] | loading feathers into the catalog | fatal, catalog keeps previous set |
//! | [`ModelError`] | property writes and network operations | depends on variant |
//!
//! Rejected state transitions are not errors: they come back as
//! [`Transition::Unhandled`](crate::state::Transition) or `Blocked`.

use thiserror::Error;

use crate::datasource::DataSourceError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("state `{state}` sends `{event}` to unknown state `{target}`")]
    UnknownTarget {
        state: String,
        event: String,
        target: String,
    },

    #[error("state `{state}` has no child `{child}` to use as initial state")]
    UnknownInitial { state: String, child: String },

    #[error("duplicate state `{0}`")]
    DuplicateState(String),

    #[error("invalid state name at `{0}`")]
    InvalidName(String),
}

/// Fatal problems with a schema payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("feather `{feather}` inherits from unknown feather `{ancestor}`")]
    MissingAncestor { feather: String, ancestor: String },

    #[error("feather `{feather}` has a cyclic inheritance chain: {}", chain.join(" -> "))]
    Cycle { feather: String, chain: Vec<String> },

    #[error("property `{feather}.{property}` relates to unknown feather `{target}`")]
    UnknownRelation {
        feather: String,
        property: String,
        target: String,
    },

    #[error("property `{feather}.{property}` refers back through `{target}.{reference}`, which is not a property")]
    UnknownBackReference {
        feather: String,
        property: String,
        target: String,
        reference: String,
    },

    #[error("property `{feather}.{property}` uses unknown default `{marker}`")]
    UnknownDefault {
        feather: String,
        property: String,
        marker: String,
    },

    #[error("feather `{feather}` is still inherited by {}", children.join(", "))]
    InUse {
        feather: String,
        children: Vec<String>,
    },

    #[error("feather `{0}` is not defined")]
    UnknownFeather(String),

    #[error("malformed schema payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("feather `{feather}` has no property `{property}`")]
    UnknownProperty { feather: String, property: String },

    #[error("property `{0}` is read only")]
    ReadOnly(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("feather `{0}` is not defined")]
    UnknownFeather(String),

    #[error("unexpected response: {0}")]
    Malformed(String),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}

impl ModelError {
    /// Errors that leave the instance usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ReadOnly(_) | Self::Validation(_) | Self::Conflict(_) | Self::UnknownProperty { .. }
        )
    }
}

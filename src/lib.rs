//! Featherbone client: HTTP datasource, push feed and configuration around
//! the [`featherbone_core`] runtime.

pub mod client;
pub mod config;
pub mod feed;
pub mod render;

pub use client::{ClientError, HttpDataSource};
pub use config::ClientConfig;
pub use feed::{open_session, EventStream, Session, SseDecoder};
pub use featherbone_core;

//! Namespace-routed fanout WebSocket broker.
//!
//! An AMQP fanout exchange carries namespace-tagged messages; subscribers
//! connect over WebSocket to a path that IS their namespace and receive
//! every message whose namespace is that subscription or a descendant of
//! it. See `dispatcher` for the fan-out core and `server` for the HTTP/WS
//! surface.

pub mod amqp;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod namespace;
pub mod pump;
pub mod quiesce;
pub mod server;
pub mod signer;

pub use error::{Error, Result};

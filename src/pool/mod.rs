//! The connection pool: a single-task actor that owns one connection to every configured contact
//! point, multiplexes many in-flight requests over each connection's CQL stream ids, and
//! retries/re-routes requests across connections as they come and go.
//!
//! Everything under this module is `pub(crate)`; [`crate::Cluster`] is the public surface.

mod connection;
mod events;
mod options;
mod worker;

pub use options::{ConnectionOptions, PoolOptions};

pub(crate) use connection::{ConnectionId, MAX_CONNECTIONS};
pub(crate) use events::{RequestKey, WorkerMessage};
pub(crate) use worker::{PoolHandle, PoolWorker};

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(
        clippy::unreadable_literal,
        clippy::cognitive_complexity,
        clippy::float_cmp,
        clippy::match_like_matches_macro,
        clippy::derive_partial_eq_without_eq
    )
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod codec;
mod cluster;
pub mod error;
mod frame;
mod pool;
mod request;
pub mod results;
pub(crate) mod runtime;

pub use crate::{
    cluster::{Cluster, ClusterOptions, DEFAULT_PORT},
    error::{Error, ErrorKind, Result},
    pool::{ConnectionOptions, PoolOptions},
    request::Statement,
    results::{QueryResult, Row, SchemaChangeEvent, SchemaChangeTarget, SchemaChangeType},
};

/// A boxed future, used at a few API seams where naming the concrete future type isn't practical.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

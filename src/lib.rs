#![cfg_attr(docsrs, feature(doc_cfg))]
//! # asynfed: asynchronous federated learning coordination
//!
//! Many independent clients train a model locally and periodically exchange versioned model
//! artifacts with a central server, through a message bus and a shared object store. There is no
//! global round boundary: clients join, leave and reconnect at arbitrary times, local updates
//! arrive out of order and at different staleness levels, and transfers fail transiently.
//!
//! The crate is organized in layers:
//! - [`storage`]: object stores, bounded-retry transfers, the `{version}.{ext}` artifact naming
//!   scheme and the retention of old artifacts.
//! - [`messages`] and [`messenger`]: the JSON envelope exchanged on the bus, and the
//!   publish/subscribe plumbing that delivers it.
//! - [`server`]: the worker registry, the aggregation strategies and the coordinator that folds
//!   local updates into new global versions.
//! - [`client`]: the coordinator that performs the handshake, adopts global versions, trains and
//!   publishes local updates.
//!
//! Both coordinators are generic over their collaborators (object store, transport and model), so
//! they can be wired to Redis and S3 in production, or to in-memory doubles in tests.

#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate tracing;

pub mod client;
pub mod messages;
pub mod messenger;
pub mod model;
pub mod schedule;
pub mod server;
pub mod settings;
pub mod storage;
pub(crate) mod utils;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Redis backing store for [`region_cache`].
//!
//! [`RedisStore`] implements [`region_cache::RegionStore`] over the `redis` crate, so any
//! region strategy can keep its values in a Redis server shared by many processes.
//!
//! Guarded and multi-key operations are Lua scripts that check the region generation and
//! apply their effect, including any notification, in one atomic step. Subscriptions use
//! dedicated connections that reconnect with jittered backoff and report the gap as
//! [`region_cache::StoreEvent::Disrupted`], which makes two-layer regions drop their
//! local copies.

mod pubsub;
mod scripts;
mod store;

pub use store::RedisStore;

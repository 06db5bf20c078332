//! Field-operations sync client.
//!
//! The engine itself lives in the `sync_engine` crate; this crate adds the
//! `fieldops` command line and the offline demo.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use sync_engine::{
//!     InMemoryRemote, LocalStore, MutationQueue, StaticToken, SyncConfig, SyncEngine, Tractor,
//!     TractorModel, TractorRepository,
//! };
//!
//! let queue = MutationQueue::new(LocalStore::volatile());
//! let tractors = TractorRepository::new(queue.clone());
//!
//! // Works offline: the write lands locally and is queued.
//! let t1 = tractors.create(Tractor::new("coop-1", TractorModel::Mf240, "SN-1", 100.0)).unwrap();
//! assert!(!t1.synced);
//!
//! let engine = SyncEngine::new(
//!     queue,
//!     Arc::new(InMemoryRemote::starting_at(42)),
//!     Arc::new(StaticToken::new("token")),
//!     SyncConfig::default(),
//! );
//! assert_eq!(engine.queue().pending_count().unwrap(), 1);
//! ```

pub mod demo;

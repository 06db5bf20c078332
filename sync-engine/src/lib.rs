mod auth;
mod config;
mod connectivity;
mod entity;
mod error;
mod events;
mod queue;
pub mod remote;
mod repository;
mod storage;
mod store;
mod sync;

pub use auth::{AuthProvider, StaticToken};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, HttpProbe, ManualProbe, ReachabilityProbe};
pub use entity::{
    is_temp_id, new_temp_id, Booking, DomainEntity, Entity, EntityType, MutationAction, Prediction,
    PredictionStatus, Tractor, TractorModel, UsageIntensity,
};
pub use error::{Error, Result};
pub use events::{DrainOutcome, PendingItem, SyncEvent, SyncPhase, SyncReport, SyncStatus, SyncTrigger};
pub use queue::{MutationQueue, SharedStore};
pub use remote::{HttpRemote, InMemoryRemote, RemoteError, RemoteRecord, RemoteService};
pub use repository::{BookingRepository, PredictionRepository, Repository, TractorRepository};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{EntityFilter, EntityRecord, MemoryStorage, MutationState, NewMutation, PendingMutation, Storage};
pub use store::{CreateAck, LocalStore, WriteOutcome};
pub use sync::{describe, SyncCursor, SyncEngine, SyncHandle};

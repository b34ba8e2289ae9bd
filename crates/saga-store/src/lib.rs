//! Durable storage for saga progress records.
//!
//! Both record kinds are keyed by saga id and guarded by optimistic
//! concurrency: a write carries the version it was read at and fails with
//! [`StoreError::ConcurrencyConflict`] if another writer got there first.
//! [`SagaRepositoryExt::modify`] and [`ChoreographyRepositoryExt::modify`]
//! implement the re-read-and-reapply loop.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use repository::{
    ChoreographyRepository, ChoreographyRepositoryExt, MAX_MODIFY_ATTEMPTS, SagaRepository,
    SagaRepositoryExt,
};

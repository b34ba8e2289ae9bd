//! Shared identifiers and value types used across the saga workspace.

mod ids;
mod money;
mod version;

pub use ids::{EventId, SagaId};
pub use money::{Money, MoneyError};
pub use version::Version;

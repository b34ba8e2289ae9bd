//! Audit trail of business events.
//!
//! [`AuditConsumer`] is bound to every routing key and turns each event into
//! one [`AuditLog`] row, classified by [`AuditLevel`] and tagged for
//! compliance. Rows are never updated; the retention sweep deletes them once
//! they age out.

pub mod consumer;
pub mod error;
pub mod level;
pub mod log;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod repository;

pub use consumer::AuditConsumer;
pub use error::{AuditError, Result};
pub use level::AuditLevel;
pub use log::AuditLog;
pub use memory::InMemoryAuditRepository;
pub use postgres::PostgresAuditRepository;
pub use query::{AuditCriteria, AuditStatistics, Page, PageRequest};
pub use repository::{AuditRepository, AuditRepositoryExt};

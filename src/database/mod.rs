//! Database access
//!
//! Sessions against site databases, SQLSTATE classification and the error
//! sensitivity policy that decides which failures are tolerated.

pub mod error;
#[cfg(any(test, feature = "memory-backend"))]
pub mod memory;
#[cfg(feature = "postgres-backend")]
pub mod postgres;
pub mod sensitivity;
pub mod session;

pub use error::{DatabaseError, DbErrorKind, classify_sqlstate};
#[cfg(any(test, feature = "memory-backend"))]
pub use memory::{MemoryDatabase, MemorySessionFactory};
#[cfg(feature = "postgres-backend")]
pub use postgres::{PostgresSession, PostgresSessionFactory};
pub use sensitivity::ErrorSensitivity;
pub use session::{Session, SessionFactory, SiteTarget};

//! DCC ETL - schema lifecycle management for a multi-site research data warehouse
//!
//! Provides:
//! - Stock data model metadata loading (JSON/YAML documents)
//! - Site-aware table transforms (site name, id mapping, concept names, age)
//! - Index and constraint planning with dependency-ordered statement generation
//! - Sequential or parallel execution across site databases under an error
//!   sensitivity policy
//! - The per-site lifecycle: prepare database, transform, add/undo indexes and
//!   constraints, undo transforms

pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod model;
pub mod models;
pub mod naming;
pub mod planner;
pub mod statements;
pub mod transform;

// Re-export commonly used types
pub use config::{ConfigError, EtlConfig};
pub use connection::{ConnectionError, ConnectionInfo};
pub use database::{
    DatabaseError, DbErrorKind, ErrorSensitivity, Session, SessionFactory, SiteTarget,
};
#[cfg(any(test, feature = "memory-backend"))]
pub use database::{MemoryDatabase, MemorySessionFactory};
#[cfg(feature = "postgres-backend")]
pub use database::{PostgresSession, PostgresSessionFactory};
pub use error::{EtlError, EtlResult};
pub use executor::{ExecutionMode, Executor, ExecutorError, OperationResult, Outcome, RunReport};
pub use lifecycle::{
    Derivation, LifecycleError, LifecycleReport, LifecycleState, LifecycleStep, PrimaryKeyMove,
    SchemaLifecycle,
};
pub use model::{FileMetadataProvider, InMemoryMetadataProvider, MetadataError, MetadataProvider};
pub use models::{
    Column, ConstraintDefinition, ConstraintKind, Definition, ForeignKey, IndexDefinition,
    SchemaMetadata, Select, Table,
};
pub use naming::{DatabaseKind, NamingError};
pub use planner::{
    PlanningError, TableScope, plan_constraints, plan_definitions, plan_dropped_indexes,
    plan_indexes,
};
pub use statements::{DdlAction, Statement, generate_create, generate_drop};
pub use transform::{Transform, TransformContext, TransformError, TransformRegistry};

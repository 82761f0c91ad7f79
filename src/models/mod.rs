//! Models module
//!
//! Structural schema description shared by every other module: tables,
//! columns, index and constraint definitions, and the selection model that
//! transforms rewrite.

pub mod column;
pub mod definitions;
pub mod metadata;
pub mod select;
pub mod table;

pub use column::{Column, ForeignKey};
pub use definitions::{ConstraintDefinition, ConstraintKind, Definition, IndexDefinition};
pub use metadata::SchemaMetadata;
pub use select::{Expr, Join, JoinKind, Select, SelectItem, TableRef};
pub use table::{KeyConstraint, Table};

//! Statement generation
//!
//! Turns planned index and constraint definitions into ordered create/drop
//! statements, each carrying the error sensitivity to apply when it runs.

pub mod generator;
pub mod sql;
pub mod statement;

pub use generator::{generate_create, generate_drop, generate_index_removal, topological_order};
pub use sql::{quote_identifier, quote_literal};
pub use statement::{DdlAction, Statement};

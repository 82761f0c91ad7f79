//! Schema lifecycle
//!
//! Database preparation, the transform swap, index and constraint
//! add/undo, undoing transforms, primary-key moves and external derivations,
//! orchestrated per (version, site) pair.

pub mod derivation;
pub mod error;
pub mod orchestrator;
pub mod pk_move;
pub mod state;
pub mod steps;

pub use derivation::Derivation;
pub use error::LifecycleError;
pub use orchestrator::{LifecycleReport, SchemaLifecycle, configured_registry};
pub use pk_move::{PrimaryKeyMove, UPDATE_TABLE_PREFIX, move_primary_key_statements};
pub use state::{Admission, LifecycleState, LifecycleStep, StateTracker};
pub use steps::Roles;

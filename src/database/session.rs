//! Session interface to one site database

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::DatabaseError;
use crate::connection::ConnectionInfo;
use crate::statements::Statement;

/// One site and where to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteTarget {
    pub site: String,
    pub connection: ConnectionInfo,
}

impl SiteTarget {
    pub fn new(site: impl Into<String>, connection: ConnectionInfo) -> Self {
        Self {
            site: site.into(),
            connection,
        }
    }
}

impl fmt::Display for SiteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.site, self.connection.redacted())
    }
}

/// An open connection to one site database.
///
/// Sessions are owned by a single task and never shared.
#[async_trait]
pub trait Session: Send {
    /// Execute one statement, returning the number of rows affected
    async fn execute(&mut self, statement: &Statement) -> Result<u64, DatabaseError>;

    /// Release the session
    async fn close(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Opens sessions against site targets
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    async fn open(&self, target: &SiteTarget) -> Result<Box<dyn Session>, DatabaseError>;
}

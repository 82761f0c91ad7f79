//! PostgreSQL sessions over tokio-postgres

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

use super::error::{DatabaseError, DbErrorKind, INVALID_TABLE_DEFINITION};
use super::session::{Session, SessionFactory, SiteTarget};
use crate::models::{ConstraintDefinition, ConstraintKind};
use crate::statements::{DdlAction, Statement};

/// Whether `table` already carries exactly this primary key
const MATCHING_PRIMARY_KEY_SQL: &str = "SELECT 1 FROM pg_constraint c \
     WHERE c.contype = 'p' AND c.conname = $1 AND c.conrelid = $2::text::regclass \
     AND ARRAY(SELECT a.attname::text FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord) \
     JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum ORDER BY k.ord) = $3::text[]";

fn classify(err: tokio_postgres::Error) -> DatabaseError {
    match err.code() {
        Some(state) => DatabaseError::from_sqlstate(state.code(), err.to_string()),
        // No SQLSTATE means the failure happened below the protocol
        None => DatabaseError::connectivity(err.to_string()),
    }
}

/// One open connection to a site database
pub struct PostgresSession {
    client: Client,
    site: String,
}

impl PostgresSession {
    /// A second primary key is only a re-add when name and columns match
    async fn reclassify_primary_key(
        &self,
        error: DatabaseError,
        key: &ConstraintDefinition,
    ) -> DatabaseError {
        let matches = self
            .client
            .query_opt(MATCHING_PRIMARY_KEY_SQL, &[&key.name, &key.table, &key.columns])
            .await;
        match matches {
            Ok(Some(_)) => error.with_kind(DbErrorKind::AlreadyExists),
            Ok(None) => error,
            Err(e) => {
                debug!(site = %self.site, error = %e, "Primary key catalog lookup failed");
                error
            }
        }
    }
}

#[async_trait]
impl Session for PostgresSession {
    async fn execute(&mut self, statement: &Statement) -> Result<u64, DatabaseError> {
        debug!(site = %self.site, sql = %statement.sql, "Executing statement");
        let messages = match self.client.simple_query(&statement.sql).await {
            Ok(messages) => messages,
            Err(e) => {
                let error = classify(e);
                return Err(match &statement.action {
                    DdlAction::AddConstraint(key)
                        if key.kind == ConstraintKind::PrimaryKey
                            && error.code.as_deref() == Some(INVALID_TABLE_DEFINITION) =>
                    {
                        self.reclassify_primary_key(error, key).await
                    }
                    _ => error,
                });
            }
        };
        let rows = messages
            .iter()
            .filter_map(|m| match m {
                tokio_postgres::SimpleQueryMessage::CommandComplete(n) => Some(*n),
                _ => None,
            })
            .sum();
        Ok(rows)
    }

    async fn close(self: Box<Self>) -> Result<(), DatabaseError> {
        drop(self.client);
        Ok(())
    }
}

/// Connects to each site with its own connection string
#[derive(Debug, Clone, Default)]
pub struct PostgresSessionFactory;

impl PostgresSessionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionFactory for PostgresSessionFactory {
    async fn open(&self, target: &SiteTarget) -> Result<Box<dyn Session>, DatabaseError> {
        let conn_str = target.connection.to_conn_string();
        let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
            .await
            .map_err(classify)?;

        let site = target.site.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(site = %site, error = %e, "PostgreSQL connection error");
            }
        });

        debug!(site = %target.site, connection = %target.connection.redacted(), "Opened session");
        Ok(Box::new(PostgresSession {
            client,
            site: target.site.clone(),
        }))
    }
}

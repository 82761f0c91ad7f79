//! In-memory database backend
//!
//! Keeps a catalog of databases, schemas, tables, indexes and constraints and
//! answers DDL with the same SQLSTATE codes PostgreSQL uses, so executor and
//! lifecycle behavior can be exercised without a server. Row data is reduced
//! to a count per table; `CREATE TABLE AS` copies the count of its base
//! relation and does not evaluate joins. Id maps are kept as the ranges of
//! warehouse ids handed out, drawn from per-database last-id counters that
//! start at zero.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::error::{DatabaseError, DbErrorKind, INVALID_TABLE_DEFINITION};
use super::session::{Session, SessionFactory, SiteTarget};
use crate::models::{ConstraintDefinition, ConstraintKind, IndexDefinition, Select, Table};
use crate::statements::{DdlAction, Statement};

const DEFAULT_DATABASE: &str = "postgres";
const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Clone, Default)]
struct ColumnState {
    name: String,
    not_null: bool,
}

#[derive(Debug, Clone, Default)]
struct TableState {
    columns: Vec<ColumnState>,
    rows: u64,
    logged: bool,
    indexes: BTreeMap<String, IndexDefinition>,
    constraints: BTreeMap<String, ConstraintDefinition>,
}

impl TableState {
    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    fn primary_key(&self) -> Option<&ConstraintDefinition> {
        self.constraints
            .values()
            .find(|c| c.kind == ConstraintKind::PrimaryKey)
    }

    /// Index-backed relation names owned by this table
    fn relation_names(&self) -> impl Iterator<Item = &String> {
        self.indexes.keys().chain(
            self.constraints
                .values()
                .filter(|c| c.kind.is_key())
                .map(|c| &c.name),
        )
    }
}

#[derive(Debug, Clone, Default)]
struct SchemaState {
    tables: BTreeMap<String, TableState>,
}

impl SchemaState {
    fn relation_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
            || self
                .tables
                .values()
                .any(|t| t.relation_names().any(|n| n == name))
    }
}

#[derive(Debug, Clone)]
struct DatabaseState {
    schemas: BTreeMap<String, SchemaState>,
    /// Last id handed out, keyed by `schema.table` of the counter
    id_counters: BTreeMap<String, u64>,
    /// Id ranges recorded in each map, keyed by `schema.table` of the map
    id_maps: BTreeMap<String, Vec<RangeInclusive<u64>>>,
}

impl Default for DatabaseState {
    fn default() -> Self {
        let mut schemas = BTreeMap::new();
        schemas.insert(DEFAULT_SCHEMA.to_string(), SchemaState::default());
        Self {
            schemas,
            id_counters: BTreeMap::new(),
            id_maps: BTreeMap::new(),
        }
    }
}

fn relation_key(schema: &str, table: &str) -> String {
    format!("{schema}.{table}")
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    site: Option<String>,
    pattern: String,
    code: String,
}

#[derive(Debug)]
struct Cluster {
    databases: BTreeMap<String, DatabaseState>,
    unreachable: BTreeSet<String>,
    failures: Vec<InjectedFailure>,
    log: Vec<ExecutedStatement>,
}

impl Default for Cluster {
    fn default() -> Self {
        let mut databases = BTreeMap::new();
        databases.insert(DEFAULT_DATABASE.to_string(), DatabaseState::default());
        Self {
            databases,
            unreachable: BTreeSet::new(),
            failures: Vec::new(),
            log: Vec::new(),
        }
    }
}

/// A statement the memory backend accepted, with where it ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    pub site: String,
    pub database: String,
    pub sql: String,
}

/// Where unqualified names resolve for one session
struct Scope<'a> {
    database: &'a str,
    search_path: &'a [String],
}

fn err(code: &str, message: impl Into<String>) -> DatabaseError {
    DatabaseError::from_sqlstate(code, message)
}

impl Cluster {
    fn database_mut(&mut self, name: &str) -> Result<&mut DatabaseState, DatabaseError> {
        self.databases
            .get_mut(name)
            .ok_or_else(|| err("3D000", format!("database \"{name}\" does not exist")))
    }

    fn apply(&mut self, scope: &Scope<'_>, action: &DdlAction) -> Result<u64, DatabaseError> {
        if let DdlAction::CreateDatabase { name, .. } = action {
            if self.databases.contains_key(name) {
                return Err(err("42P04", format!("database \"{name}\" already exists")));
            }
            self.databases.insert(name.clone(), DatabaseState::default());
            return Ok(0);
        }

        let db = self.database_mut(scope.database)?;
        match action {
            DdlAction::CreateDatabase { .. } => Ok(0),
            DdlAction::CreateSchema { name, .. } => {
                if db.schemas.contains_key(name) {
                    return Err(err("42P06", format!("schema \"{name}\" already exists")));
                }
                db.schemas.insert(name.clone(), SchemaState::default());
                Ok(0)
            }
            DdlAction::DropSchema {
                name,
                if_exists,
                cascade,
            } => {
                match db.schemas.get(name) {
                    None if *if_exists => return Ok(0),
                    None => {
                        return Err(err("3F000", format!("schema \"{name}\" does not exist")));
                    }
                    Some(schema) if !schema.tables.is_empty() && !cascade => {
                        return Err(err(
                            "2BP01",
                            format!("cannot drop schema {name} because other objects depend on it"),
                        ));
                    }
                    Some(_) => {}
                }
                db.schemas.remove(name);
                Ok(0)
            }
            DdlAction::CreateIndex(index) => {
                let schema_name = resolve_table(db, scope.search_path, &index.table)?;
                let schema = schema_entry(db, &schema_name)?;
                if schema.relation_exists(&index.name) {
                    return Err(err(
                        "42P07",
                        format!("relation \"{}\" already exists", index.name),
                    ));
                }
                let table = table_entry(schema, &index.table)?;
                if let Some(missing) = index.columns.iter().find(|c| !table.has_column(c)) {
                    return Err(err("42703", format!("column \"{missing}\" does not exist")));
                }
                table.indexes.insert(index.name.clone(), index.clone());
                Ok(0)
            }
            DdlAction::DropIndex {
                name, if_exists, ..
            } => {
                for schema_name in scope.search_path {
                    let Some(schema) = db.schemas.get_mut(schema_name) else {
                        continue;
                    };
                    for table in schema.tables.values_mut() {
                        if table.indexes.remove(name).is_some() {
                            return Ok(0);
                        }
                        if table.constraints.get(name).is_some_and(|c| c.kind.is_key()) {
                            return Err(err(
                                "2BP01",
                                format!(
                                    "cannot drop index {name} because constraint {name} requires it"
                                ),
                            ));
                        }
                    }
                }
                if *if_exists {
                    return Ok(0);
                }
                Err(err("42704", format!("index \"{name}\" does not exist")))
            }
            DdlAction::AddConstraint(constraint) => add_constraint(db, scope.search_path, constraint),
            DdlAction::DropConstraint {
                constraint,
                cascade,
            } => drop_constraint(db, scope.search_path, constraint, *cascade),
            DdlAction::RenameConstraint { table, from, to } => {
                let schema_name = resolve_table(db, scope.search_path, table)?;
                let state = table_entry(schema_entry(db, &schema_name)?, table)?;
                if state.constraints.contains_key(to) {
                    return Err(err(
                        "42710",
                        format!("constraint \"{to}\" for relation \"{table}\" already exists"),
                    ));
                }
                let mut constraint = state.constraints.remove(from).ok_or_else(|| {
                    err(
                        "42704",
                        format!("constraint \"{from}\" of relation \"{table}\" does not exist"),
                    )
                })?;
                constraint.name = to.clone();
                state.constraints.insert(to.clone(), constraint);
                Ok(0)
            }
            DdlAction::CreateTableAs {
                schema,
                table,
                select,
                unlogged,
            } => {
                let created = table_from_select(db, scope.search_path, select)?;
                let rows = created.rows;
                let target = schema_entry(db, schema)?;
                if target.relation_exists(table) {
                    return Err(err("42P07", format!("relation \"{table}\" already exists")));
                }
                target.tables.insert(
                    table.clone(),
                    TableState {
                        logged: !unlogged,
                        ..created
                    },
                );
                Ok(rows)
            }
            DdlAction::SetLogged { schema, table } => {
                table_entry(schema_entry(db, schema)?, table)?.logged = true;
                Ok(0)
            }
            DdlAction::DropTable {
                schema,
                table,
                cascade,
            } => {
                let target = schema_entry(db, schema)?;
                if !target.tables.contains_key(table) {
                    return Err(err("42P01", format!("table \"{table}\" does not exist")));
                }
                let referenced = target.tables.iter().any(|(name, other)| {
                    name != table
                        && other
                            .constraints
                            .values()
                            .any(|c| c.reference().is_some_and(|(rt, _)| rt == table.as_str()))
                });
                if referenced && !cascade {
                    return Err(err(
                        "2BP01",
                        format!("cannot drop table {table} because other objects depend on it"),
                    ));
                }
                if let Some(state) = db.schemas.get_mut(schema) {
                    state.tables.remove(table);
                }
                let (schema, table) = (schema.clone(), table.clone());
                drop_foreign_keys_into(db, |s, t| s == schema && t == table);
                Ok(0)
            }
            DdlAction::SetSchema {
                schema,
                table,
                new_schema,
            } => {
                let target = db.schemas.get(new_schema).ok_or_else(|| {
                    err("3F000", format!("schema \"{new_schema}\" does not exist"))
                })?;
                if target.relation_exists(table) {
                    return Err(err(
                        "42P07",
                        format!("relation \"{table}\" already exists in schema \"{new_schema}\""),
                    ));
                }
                let state = schema_entry(db, schema)?
                    .tables
                    .remove(table)
                    .ok_or_else(|| err("42P01", format!("table \"{table}\" does not exist")))?;
                schema_entry(db, new_schema)?
                    .tables
                    .insert(table.clone(), state);
                Ok(0)
            }
            DdlAction::MapNewIds {
                table,
                map_schema,
                map_table,
                counter_schema,
                counter_table,
                ..
            } => {
                let data_schema = resolve_table(db, scope.search_path, table)?;
                let rows = db
                    .schemas
                    .get(&data_schema)
                    .and_then(|s| s.tables.get(table))
                    .map_or(0, |t| t.rows);
                let map_schema = map_schema
                    .as_deref()
                    .or_else(|| scope.search_path.first().map(String::as_str))
                    .unwrap_or(DEFAULT_SCHEMA);
                let map = db
                    .id_maps
                    .entry(relation_key(map_schema, map_table))
                    .or_default();
                let mapped: u64 = map.iter().map(|r| r.end() - r.start() + 1).sum();
                let new_ids = rows.saturating_sub(mapped);
                if new_ids == 0 {
                    return Ok(0);
                }
                let last_id = db
                    .id_counters
                    .entry(relation_key(counter_schema, counter_table))
                    .or_default();
                let first = *last_id + 1;
                *last_id += new_ids;
                map.push(first..=*last_id);
                Ok(new_ids)
            }
            DdlAction::Grant { .. } | DdlAction::Raw(_) => Ok(0),
        }
    }
}

fn schema_entry<'a>(
    db: &'a mut DatabaseState,
    name: &str,
) -> Result<&'a mut SchemaState, DatabaseError> {
    db.schemas
        .get_mut(name)
        .ok_or_else(|| err("3F000", format!("schema \"{name}\" does not exist")))
}

fn table_entry<'a>(
    schema: &'a mut SchemaState,
    name: &str,
) -> Result<&'a mut TableState, DatabaseError> {
    schema
        .tables
        .get_mut(name)
        .ok_or_else(|| err("42P01", format!("relation \"{name}\" does not exist")))
}

/// First search-path schema holding `table`
fn resolve_table(
    db: &DatabaseState,
    search_path: &[String],
    table: &str,
) -> Result<String, DatabaseError> {
    search_path
        .iter()
        .find(|s| db.schemas.get(*s).is_some_and(|st| st.tables.contains_key(table)))
        .cloned()
        .ok_or_else(|| err("42P01", format!("relation \"{table}\" does not exist")))
}

/// Removes foreign keys that point at tables matching `target(schema, table)`
fn drop_foreign_keys_into(db: &mut DatabaseState, target: impl Fn(&str, &str) -> bool) {
    for (schema_name, schema) in db.schemas.iter_mut() {
        for table in schema.tables.values_mut() {
            table.constraints.retain(|_, c| match c.reference() {
                Some((rt, _)) => !target(schema_name.as_str(), rt),
                None => true,
            });
        }
    }
}

fn table_from_select(
    db: &DatabaseState,
    search_path: &[String],
    select: &Select,
) -> Result<TableState, DatabaseError> {
    let schema_name = match &select.from.schema {
        Some(schema) => {
            if !db.schemas.contains_key(schema) {
                return Err(err("3F000", format!("schema \"{schema}\" does not exist")));
            }
            schema.clone()
        }
        None => resolve_table(db, search_path, &select.from.name)?,
    };
    let source = db
        .schemas
        .get(&schema_name)
        .and_then(|s| s.tables.get(&select.from.name))
        .ok_or_else(|| {
            err(
                "42P01",
                format!("relation \"{}\" does not exist", select.from.name),
            )
        })?;

    let base = select.base_name();
    for item in &select.items {
        if let crate::models::Expr::Column {
            relation: Some(relation),
            column,
        } = &item.expr
            && relation == base
            && !source.has_column(column)
        {
            return Err(err("42703", format!("column {relation}.{column} does not exist")));
        }
    }

    let mut columns = Vec::new();
    for name in select.output_names() {
        if columns.iter().any(|c: &ColumnState| c.name == name) {
            return Err(err("42701", format!("column \"{name}\" specified more than once")));
        }
        columns.push(ColumnState {
            name: name.to_string(),
            not_null: false,
        });
    }
    Ok(TableState {
        columns,
        rows: source.rows,
        ..TableState::default()
    })
}

fn add_constraint(
    db: &mut DatabaseState,
    search_path: &[String],
    constraint: &ConstraintDefinition,
) -> Result<u64, DatabaseError> {
    let schema_name = resolve_table(db, search_path, &constraint.table)?;

    if let Some((referred_table, referred_columns)) = constraint.reference() {
        let referred_schema = resolve_table(db, search_path, referred_table)?;
        let has_key = db
            .schemas
            .get(&referred_schema)
            .and_then(|s| s.tables.get(referred_table))
            .is_some_and(|t| {
                t.constraints
                    .values()
                    .any(|c| c.kind.is_key() && c.columns.as_slice() == referred_columns)
            });
        if !has_key {
            return Err(err(
                "42830",
                format!(
                    "there is no unique constraint matching given keys for referenced table \"{referred_table}\""
                ),
            ));
        }
    }

    let schema = schema_entry(db, &schema_name)?;
    let name_taken = constraint.kind.is_key() && schema.relation_exists(&constraint.name);
    let table = table_entry(schema, &constraint.table)?;
    if let Some(missing) = constraint.columns.iter().find(|c| !table.has_column(c)) {
        return Err(err(
            "42703",
            format!(
                "column \"{missing}\" of relation \"{}\" does not exist",
                constraint.table
            ),
        ));
    }

    match constraint.kind {
        ConstraintKind::NotNull => {
            for column in table.columns.iter_mut() {
                if constraint.columns.contains(&column.name) {
                    column.not_null = true;
                }
            }
            return Ok(0);
        }
        ConstraintKind::PrimaryKey => {
            if let Some(existing) = table.primary_key() {
                let error = err(
                    INVALID_TABLE_DEFINITION,
                    format!(
                        "multiple primary keys for table \"{}\" are not allowed",
                        constraint.table
                    ),
                );
                // Only the same key under the same name is a re-add
                return Err(if existing.name == constraint.name
                    && existing.columns == constraint.columns
                {
                    error.with_kind(DbErrorKind::AlreadyExists)
                } else {
                    error
                });
            }
        }
        _ => {}
    }
    if name_taken {
        return Err(err(
            "42P07",
            format!("relation \"{}\" already exists", constraint.name),
        ));
    }
    if table.constraints.contains_key(&constraint.name) {
        return Err(err(
            "42710",
            format!(
                "constraint \"{}\" for relation \"{}\" already exists",
                constraint.name, constraint.table
            ),
        ));
    }
    if constraint.kind == ConstraintKind::PrimaryKey {
        for column in table.columns.iter_mut() {
            if constraint.columns.contains(&column.name) {
                column.not_null = true;
            }
        }
    }
    table
        .constraints
        .insert(constraint.name.clone(), constraint.clone());
    Ok(0)
}

fn drop_constraint(
    db: &mut DatabaseState,
    search_path: &[String],
    constraint: &ConstraintDefinition,
    cascade: bool,
) -> Result<u64, DatabaseError> {
    let schema_name = resolve_table(db, search_path, &constraint.table)?;
    let table = table_entry(schema_entry(db, &schema_name)?, &constraint.table)?;

    if constraint.kind == ConstraintKind::NotNull {
        for column in table.columns.iter_mut() {
            if constraint.columns.contains(&column.name) {
                column.not_null = false;
            }
        }
        return Ok(0);
    }

    let existing = table.constraints.get(&constraint.name).cloned().ok_or_else(|| {
        err(
            "42704",
            format!(
                "constraint \"{}\" of relation \"{}\" does not exist",
                constraint.name, constraint.table
            ),
        )
    })?;

    if existing.kind.is_key() {
        let dependent = |c: &ConstraintDefinition| {
            c.reference().is_some_and(|(rt, rc)| {
                rt == existing.table && rc == existing.columns.as_slice()
            })
        };
        let referenced = db
            .schemas
            .get(&schema_name)
            .is_some_and(|s| s.tables.values().any(|t| t.constraints.values().any(dependent)));
        if referenced && !cascade {
            return Err(err(
                "2BP01",
                format!(
                    "cannot drop constraint {} on table {} because other objects depend on it",
                    existing.name, existing.table
                ),
            ));
        }
        if let Some(schema) = db.schemas.get_mut(&schema_name) {
            for table in schema.tables.values_mut() {
                table.constraints.retain(|_, c| !dependent(c));
            }
        }
    }

    if let Some(table) = db
        .schemas
        .get_mut(&schema_name)
        .and_then(|s| s.tables.get_mut(&constraint.table))
    {
        table.constraints.remove(&constraint.name);
    }
    Ok(0)
}

/// Shared in-memory cluster. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<Cluster>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn cluster(&self) -> MutexGuard<'_, Cluster> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply an action directly, outside any session
    pub fn apply(
        &self,
        database: &str,
        search_path: &[String],
        action: &DdlAction,
    ) -> Result<u64, DatabaseError> {
        let scope = Scope {
            database,
            search_path,
        };
        self.cluster().apply(&scope, action)
    }

    pub fn create_database(&self, name: &str) {
        self.cluster().databases.entry(name.to_string()).or_default();
    }

    pub fn create_schema(&self, database: &str, schema: &str) {
        self.cluster()
            .databases
            .entry(database.to_string())
            .or_default()
            .schemas
            .entry(schema.to_string())
            .or_default();
    }

    /// Creates `table` with `rows` rows, replacing any table of that name
    pub fn seed_table(&self, database: &str, schema: &str, table: &Table, rows: u64) {
        let mut cluster = self.cluster();
        let schema = cluster
            .databases
            .entry(database.to_string())
            .or_default()
            .schemas
            .entry(schema.to_string())
            .or_default();
        schema.tables.insert(
            table.name.clone(),
            TableState {
                columns: table
                    .columns
                    .iter()
                    .map(|c| ColumnState {
                        name: c.name.clone(),
                        not_null: !c.nullable,
                    })
                    .collect(),
                rows,
                logged: true,
                ..TableState::default()
            },
        );
    }

    /// Site whose connections will be refused
    pub fn refuse_connections(&self, site: &str) {
        self.cluster().unreachable.insert(site.to_string());
    }

    /// Fail statements whose SQL contains `pattern` with `sqlstate`,
    /// optionally only for one site
    pub fn fail_statements(&self, site: Option<&str>, pattern: &str, sqlstate: &str) {
        self.cluster().failures.push(InjectedFailure {
            site: site.map(str::to_string),
            pattern: pattern.to_string(),
            code: sqlstate.to_string(),
        });
    }

    pub fn databases(&self) -> Vec<String> {
        self.cluster().databases.keys().cloned().collect()
    }

    pub fn schemas(&self, database: &str) -> Vec<String> {
        self.cluster()
            .databases
            .get(database)
            .map(|d| d.schemas.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tables(&self, database: &str, schema: &str) -> Vec<String> {
        self.with_schema(database, schema, |s| s.tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_table(&self, database: &str, schema: &str, table: &str) -> bool {
        self.with_schema(database, schema, |s| s.tables.contains_key(table))
            .unwrap_or(false)
    }

    pub fn row_count(&self, database: &str, schema: &str, table: &str) -> Option<u64> {
        self.with_schema(database, schema, |s| s.tables.get(table).map(|t| t.rows))
            .flatten()
    }

    pub fn columns(&self, database: &str, schema: &str, table: &str) -> Vec<String> {
        self.with_schema(database, schema, |s| {
            s.tables
                .get(table)
                .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
        })
        .flatten()
        .unwrap_or_default()
    }

    pub fn is_not_null(&self, database: &str, schema: &str, table: &str, column: &str) -> bool {
        self.with_schema(database, schema, |s| {
            s.tables
                .get(table)
                .and_then(|t| t.columns.iter().find(|c| c.name == column))
                .is_some_and(|c| c.not_null)
        })
        .unwrap_or(false)
    }

    pub fn is_logged(&self, database: &str, schema: &str, table: &str) -> bool {
        self.with_schema(database, schema, |s| s.tables.get(table).is_some_and(|t| t.logged))
            .unwrap_or(false)
    }

    /// Index names in a schema, sorted
    pub fn indexes(&self, database: &str, schema: &str) -> Vec<String> {
        self.with_schema(database, schema, |s| {
            let mut names: Vec<String> = s
                .tables
                .values()
                .flat_map(|t| t.indexes.keys().cloned())
                .collect();
            names.sort();
            names
        })
        .unwrap_or_default()
    }

    /// Named constraint names in a schema, sorted
    pub fn constraints(&self, database: &str, schema: &str) -> Vec<String> {
        self.with_schema(database, schema, |s| {
            let mut names: Vec<String> = s
                .tables
                .values()
                .flat_map(|t| t.constraints.keys().cloned())
                .collect();
            names.sort();
            names
        })
        .unwrap_or_default()
    }

    /// Warehouse id ranges recorded in a map table, in the order handed out
    pub fn id_ranges(
        &self,
        database: &str,
        schema: &str,
        map_table: &str,
    ) -> Vec<RangeInclusive<u64>> {
        self.cluster()
            .databases
            .get(database)
            .and_then(|d| d.id_maps.get(&relation_key(schema, map_table)).cloned())
            .unwrap_or_default()
    }

    /// Last id a counter handed out, `None` before its first reservation
    pub fn last_id(&self, database: &str, schema: &str, counter_table: &str) -> Option<u64> {
        self.cluster()
            .databases
            .get(database)
            .and_then(|d| d.id_counters.get(&relation_key(schema, counter_table)).copied())
    }

    /// Every statement accepted so far, in order
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.cluster().log.clone()
    }

    fn with_schema<T>(
        &self,
        database: &str,
        schema: &str,
        f: impl FnOnce(&SchemaState) -> T,
    ) -> Option<T> {
        self.cluster()
            .databases
            .get(database)
            .and_then(|d| d.schemas.get(schema))
            .map(f)
    }
}

/// Session against a [`MemoryDatabase`]
pub struct MemorySession {
    database: MemoryDatabase,
    site: String,
    dbname: String,
    search_path: Vec<String>,
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&mut self, statement: &Statement) -> Result<u64, DatabaseError> {
        // Let other site tasks interleave as they would on real I/O
        tokio::task::yield_now().await;

        let mut cluster = self.database.cluster();
        if cluster.unreachable.contains(&self.site) {
            return Err(DatabaseError::connectivity(
                "server closed the connection unexpectedly",
            ));
        }
        if let Some(failure) = cluster.failures.iter().find(|f| {
            f.site.as_deref().is_none_or(|s| s == self.site) && statement.sql.contains(&f.pattern)
        }) {
            return Err(err(
                &failure.code,
                format!("injected failure for '{}'", failure.pattern),
            ));
        }

        let scope = Scope {
            database: &self.dbname,
            search_path: &self.search_path,
        };
        let rows = cluster.apply(&scope, &statement.action)?;
        debug!(site = %self.site, sql = %statement.sql, rows, "Memory statement applied");
        cluster.log.push(ExecutedStatement {
            site: self.site.clone(),
            database: self.dbname.clone(),
            sql: statement.sql.clone(),
        });
        Ok(rows)
    }

    async fn close(self: Box<Self>) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// Opens [`MemorySession`]s; the session database and search path come
/// from each target's connection info
#[derive(Debug, Clone, Default)]
pub struct MemorySessionFactory {
    database: MemoryDatabase,
}

impl MemorySessionFactory {
    pub fn new(database: MemoryDatabase) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn open(&self, target: &SiteTarget) -> Result<Box<dyn Session>, DatabaseError> {
        let dbname = target
            .connection
            .dbname()
            .unwrap_or(DEFAULT_DATABASE)
            .to_string();
        {
            let cluster = self.database.cluster();
            if cluster.unreachable.contains(&target.site) {
                return Err(DatabaseError::connectivity(format!(
                    "could not connect to server for site {}",
                    target.site
                )));
            }
            if !cluster.databases.contains_key(&dbname) {
                return Err(err("3D000", format!("database \"{dbname}\" does not exist")));
            }
        }
        let mut search_path = target.connection.search_path();
        if search_path.is_empty() {
            search_path.push(DEFAULT_SCHEMA.to_string());
        }
        Ok(Box::new(MemorySession {
            database: self.database.clone(),
            site: target.site.clone(),
            dbname,
            search_path,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ErrorSensitivity;
    use crate::models::Column;

    fn path(schema: &str) -> Vec<String> {
        vec![schema.to_string()]
    }

    fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        let person = Table::new(
            "person",
            vec![
                Column::new("person_id", "BIGINT"),
                Column::new("birth_date", "DATE"),
            ],
        );
        let visit = Table::new(
            "visit_occurrence",
            vec![
                Column::new("visit_occurrence_id", "BIGINT"),
                Column::new("person_id", "BIGINT"),
            ],
        );
        db.seed_table("pedsnet", "sitea_pedsnet", &person, 10);
        db.seed_table("pedsnet", "sitea_pedsnet", &visit, 25);
        db
    }

    #[test]
    fn test_index_create_twice_reports_already_exists() {
        let db = seeded();
        let action = DdlAction::CreateIndex(IndexDefinition::on_column(
            "idx_person_id",
            "person",
            "person_id",
        ));
        db.apply("pedsnet", &path("sitea_pedsnet"), &action).unwrap();
        let err = db
            .apply("pedsnet", &path("sitea_pedsnet"), &action)
            .unwrap_err();
        assert_eq!(err.kind, DbErrorKind::AlreadyExists);
        assert_eq!(db.indexes("pedsnet", "sitea_pedsnet"), vec!["idx_person_id"]);
    }

    #[test]
    fn test_drop_missing_index_reports_does_not_exist() {
        let db = seeded();
        let err = db
            .apply(
                "pedsnet",
                &path("sitea_pedsnet"),
                &DdlAction::DropIndex {
                    name: "nope".into(),
                    table: "person".into(),
                    if_exists: false,
                },
            )
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("42704"));
    }

    #[test]
    fn test_primary_key_twice_and_dependent_drop() {
        let db = seeded();
        let scope = path("sitea_pedsnet");
        let pk = ConstraintDefinition::primary_key("xpk_person", "person", vec!["person_id".into()]);
        let fk = ConstraintDefinition::foreign_key(
            "fpk_visit_person",
            "visit_occurrence",
            vec!["person_id".into()],
            "person",
            vec!["person_id".into()],
        );
        db.apply("pedsnet", &scope, &DdlAction::AddConstraint(pk.clone()))
            .unwrap();
        let again = db
            .apply("pedsnet", &scope, &DdlAction::AddConstraint(pk.clone()))
            .unwrap_err();
        assert_eq!(again.code.as_deref(), Some("42P16"));
        assert_eq!(again.kind, DbErrorKind::AlreadyExists);
        assert!(db.is_not_null("pedsnet", "sitea_pedsnet", "person", "person_id"));

        db.apply("pedsnet", &scope, &DdlAction::AddConstraint(fk))
            .unwrap();
        let blocked = db
            .apply(
                "pedsnet",
                &scope,
                &DdlAction::DropConstraint {
                    constraint: pk.clone(),
                    cascade: false,
                },
            )
            .unwrap_err();
        assert_eq!(blocked.kind, DbErrorKind::Unclassified);

        db.apply(
            "pedsnet",
            &scope,
            &DdlAction::DropConstraint {
                constraint: pk,
                cascade: true,
            },
        )
        .unwrap();
        assert!(db.constraints("pedsnet", "sitea_pedsnet").is_empty());
    }

    #[test]
    fn test_conflicting_primary_key_is_unclassified() {
        let db = seeded();
        let scope = path("sitea_pedsnet");
        let pk = ConstraintDefinition::primary_key("xpk_person", "person", vec!["person_id".into()]);
        db.apply("pedsnet", &scope, &DdlAction::AddConstraint(pk))
            .unwrap();

        let renamed =
            ConstraintDefinition::primary_key("xpk_person_2", "person", vec!["person_id".into()]);
        let other_columns =
            ConstraintDefinition::primary_key("xpk_person", "person", vec!["birth_date".into()]);
        for conflicting in [renamed, other_columns] {
            let err = db
                .apply("pedsnet", &scope, &DdlAction::AddConstraint(conflicting))
                .unwrap_err();
            assert_eq!(err.code.as_deref(), Some("42P16"));
            assert_eq!(err.kind, DbErrorKind::Unclassified);
            assert!(!ErrorSensitivity::Normal.suppresses(err.kind));
        }
        assert_eq!(db.constraints("pedsnet", "sitea_pedsnet"), vec!["xpk_person"]);
    }

    #[test]
    fn test_mapping_reserves_from_the_shared_counter() {
        let db = seeded();
        db.seed_table(
            "pedsnet",
            "siteb_pedsnet",
            &Table::new("person", vec![Column::new("person_id", "BIGINT")]),
            4,
        );
        let action = DdlAction::MapNewIds {
            table: "person".to_string(),
            key: "person_id".to_string(),
            map_schema: None,
            map_table: "person_ids".to_string(),
            id_column: "dcc_id".to_string(),
            site_id_type: "BIGINT".to_string(),
            counter_schema: "public".to_string(),
            counter_table: "dcc_person_id".to_string(),
        };
        assert_eq!(db.last_id("pedsnet", "public", "dcc_person_id"), None);
        assert_eq!(db.apply("pedsnet", &path("sitea_pedsnet"), &action).unwrap(), 10);
        assert_eq!(db.apply("pedsnet", &path("siteb_pedsnet"), &action).unwrap(), 4);
        // already mapped keys keep their ids
        assert_eq!(db.apply("pedsnet", &path("sitea_pedsnet"), &action).unwrap(), 0);

        assert_eq!(db.id_ranges("pedsnet", "sitea_pedsnet", "person_ids"), vec![1..=10]);
        assert_eq!(db.id_ranges("pedsnet", "siteb_pedsnet", "person_ids"), vec![11..=14]);
        assert_eq!(db.last_id("pedsnet", "public", "dcc_person_id"), Some(14));
    }

    #[test]
    fn test_create_table_as_copies_row_count() {
        let db = seeded();
        db.create_schema("pedsnet", "sitea_pedsnet_transformed");
        let select = Select::stock(
            &Table::new("person", vec![Column::new("person_id", "BIGINT")]),
            Some("sitea_pedsnet"),
        );
        let rows = db
            .apply(
                "pedsnet",
                &path("sitea_pedsnet"),
                &DdlAction::CreateTableAs {
                    schema: "sitea_pedsnet_transformed".into(),
                    table: "person".into(),
                    select,
                    unlogged: true,
                },
            )
            .unwrap();
        assert_eq!(rows, 10);
        assert!(!db.is_logged("pedsnet", "sitea_pedsnet_transformed", "person"));
        assert_eq!(
            db.columns("pedsnet", "sitea_pedsnet_transformed", "person"),
            vec!["person_id"]
        );
    }

    #[tokio::test]
    async fn test_session_respects_search_path_and_refusal() {
        let db = seeded();
        let factory = MemorySessionFactory::new(db.clone());
        let target = SiteTarget::new(
            "sitea",
            crate::connection::ConnectionInfo::parse("dbname=pedsnet")
                .unwrap()
                .with_search_path(&["sitea_pedsnet"]),
        );
        let mut session = factory.open(&target).await.unwrap();
        let stmt = Statement::new(
            DdlAction::CreateIndex(IndexDefinition::on_column("idx_v", "visit_occurrence", "person_id")),
            ErrorSensitivity::Normal,
        );
        session.execute(&stmt).await.unwrap();
        assert_eq!(db.executed().len(), 1);

        db.refuse_connections("sitea");
        let err = session.execute(&stmt).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Connectivity);
        assert!(factory.open(&target).await.is_err());
    }
}

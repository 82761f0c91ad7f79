//! Statement lists for the lifecycle steps
//!
//! Everything here is pure: statements are built from metadata, names and
//! roles, and nothing touches a database.

use crate::database::ErrorSensitivity;
use crate::models::{ConstraintKind, Definition, SchemaMetadata, Select};
use crate::naming::{
    DatabaseKind, VOCABULARY_SCHEMA, backup_schema, site_schemas, transformed_schema, undo_schema,
};
use crate::planner::PlanningError;
use crate::statements::{DdlAction, Statement, generate_drop, quote_identifier};
use crate::transform::{TransformContext, TransformRegistry};

/// Roles receiving grants on prepared schemas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roles {
    pub owner: String,
    pub staff: String,
}

const LOADING_ROLE: &str = "loading_user";
const HARVEST_ROLE: &str = "harvest_user";
const ACHILLES_ROLE: &str = "achilles_user";
const DQA_ROLE: &str = "dqa_user";
const PCORNET_ROLE: &str = "pcor_et_user";
const PCORNET_PROD_ROLE: &str = "pcornet_sas";

fn grant(privileges: &str, object: String, role: &str, sensitivity: ErrorSensitivity) -> Statement {
    Statement::new(
        DdlAction::Grant {
            privileges: privileges.to_string(),
            object,
            role: role.to_string(),
        },
        sensitivity,
    )
}

/// Usage on the schema plus select on its current tables
fn read_grants(schema: &str, roles: &[&str], sensitivity: ErrorSensitivity) -> Vec<Statement> {
    let quoted = quote_identifier(schema);
    roles
        .iter()
        .flat_map(|role| {
            [
                grant("USAGE", format!("SCHEMA {quoted}"), role, sensitivity),
                grant(
                    "SELECT",
                    format!("ALL TABLES IN SCHEMA {quoted}"),
                    role,
                    sensitivity,
                ),
            ]
        })
        .collect()
}

fn full_grant(schema: &str, role: &str, sensitivity: ErrorSensitivity) -> Statement {
    grant(
        "ALL",
        format!("SCHEMA {}", quote_identifier(schema)),
        role,
        sensitivity,
    )
}

/// Future tables created by `creator` in `schema` become readable by `roles`
fn default_read(
    creator: &str,
    schema: &str,
    roles: &[&str],
    sensitivity: ErrorSensitivity,
) -> Statement {
    let sql = format!(
        "ALTER DEFAULT PRIVILEGES FOR ROLE {} IN SCHEMA {} GRANT SELECT ON TABLES TO {}",
        quote_identifier(creator),
        quote_identifier(schema),
        roles
            .iter()
            .map(|r| quote_identifier(r))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Statement::raw(
        sql,
        format!("default privileges in {schema} for {creator}"),
        sensitivity,
    )
}

/// `CREATE DATABASE` (unless updating) and the staff create grant, run
/// against the server's maintenance database
pub fn create_database_statements(
    database: &str,
    roles: &Roles,
    update: bool,
    sensitivity: ErrorSensitivity,
) -> Vec<Statement> {
    let mut statements = Vec::new();
    if !update {
        statements.push(Statement::new(
            DdlAction::CreateDatabase {
                name: database.to_string(),
                owner: Some(roles.owner.clone()),
            },
            sensitivity,
        ));
    }
    statements.push(grant(
        "CREATE",
        format!("DATABASE {}", quote_identifier(database)),
        &roles.staff,
        sensitivity,
    ));
    statements
}

/// One site's schemas and grants inside the version database
pub fn site_schema_statements(
    site: &str,
    kind: DatabaseKind,
    roles: &Roles,
    sensitivity: ErrorSensitivity,
) -> Vec<Statement> {
    let mut statements: Vec<Statement> = site_schemas(site, kind)
        .into_iter()
        .map(|schema| {
            Statement::new(
                DdlAction::CreateSchema {
                    name: schema,
                    owner: Some(roles.owner.clone()),
                },
                sensitivity,
            )
        })
        .collect();

    let pedsnet = format!("{site}_pedsnet");
    let pcornet = format!("{site}_pcornet");
    let harvest = format!("{site}_harvest");
    let staff = roles.staff.as_str();

    match kind {
        DatabaseKind::Internal => {
            let readers = [HARVEST_ROLE, ACHILLES_ROLE, DQA_ROLE, PCORNET_ROLE, staff];
            statements.extend(read_grants(&pedsnet, &readers, sensitivity));
            statements.push(full_grant(&pedsnet, LOADING_ROLE, sensitivity));
            statements.push(default_read(LOADING_ROLE, &pedsnet, &readers, sensitivity));
            statements.push(full_grant(&pcornet, PCORNET_ROLE, sensitivity));
            statements.extend(read_grants(&pcornet, &[staff], sensitivity));
            statements.push(full_grant(&harvest, HARVEST_ROLE, sensitivity));
            statements.push(full_grant(
                &format!("{site}_achilles"),
                ACHILLES_ROLE,
                sensitivity,
            ));
        }
        DatabaseKind::Prod => {
            statements.extend(read_grants(&pedsnet, &[HARVEST_ROLE, staff], sensitivity));
            statements.extend(read_grants(&pcornet, &[PCORNET_PROD_ROLE, staff], sensitivity));
            statements.push(full_grant(&harvest, HARVEST_ROLE, sensitivity));
            statements.push(default_read(
                &roles.owner,
                &pedsnet,
                &[HARVEST_ROLE, staff],
                sensitivity,
            ));
        }
    }
    statements
}

/// The shared vocabulary schema and its grants
pub fn vocabulary_schema_statements(
    kind: DatabaseKind,
    roles: &Roles,
    sensitivity: ErrorSensitivity,
) -> Vec<Statement> {
    let mut statements = vec![Statement::new(
        DdlAction::CreateSchema {
            name: VOCABULARY_SCHEMA.to_string(),
            owner: Some(roles.owner.clone()),
        },
        sensitivity,
    )];
    let staff = roles.staff.as_str();
    match kind {
        DatabaseKind::Internal => {
            let readers = [ACHILLES_ROLE, DQA_ROLE, PCORNET_ROLE, HARVEST_ROLE, staff];
            statements.push(full_grant(VOCABULARY_SCHEMA, LOADING_ROLE, sensitivity));
            statements.extend(read_grants(VOCABULARY_SCHEMA, &readers, sensitivity));
            statements.push(default_read(
                LOADING_ROLE,
                VOCABULARY_SCHEMA,
                &readers,
                sensitivity,
            ));
        }
        DatabaseKind::Prod => {
            statements.extend(read_grants(
                VOCABULARY_SCHEMA,
                &[HARVEST_ROLE, staff],
                sensitivity,
            ));
        }
    }
    statements
}

/// Rebuild every data table of `schema` through the transforms and swap the
/// results into place, keeping the originals in `<schema>_backup`.
///
/// Fails before producing anything when a transform cannot build a table's
/// selection.
pub fn transform_statements(
    ctx: &TransformContext,
    metadata: &SchemaMetadata,
    registry: &TransformRegistry,
    schema: &str,
    owner: &str,
    sensitivity: ErrorSensitivity,
) -> Result<Vec<Statement>, PlanningError> {
    let working = transformed_schema(schema);
    let backup = backup_schema(schema);
    let tables: Vec<&str> = metadata.data_tables().map(|t| t.name.as_str()).collect();

    let mut statements = registry.pre_transform(metadata, sensitivity);
    statements.push(Statement::new(
        DdlAction::CreateSchema {
            name: working.clone(),
            owner: Some(owner.to_string()),
        },
        sensitivity,
    ));
    for table in &tables {
        let select = registry.transformed_select(ctx, metadata, table, Some(schema))?;
        statements.push(Statement::new(
            DdlAction::CreateTableAs {
                schema: working.clone(),
                table: table.to_string(),
                select,
                unlogged: true,
            },
            sensitivity,
        ));
    }
    for table in &tables {
        statements.push(Statement::new(
            DdlAction::SetLogged {
                schema: working.clone(),
                table: table.to_string(),
            },
            sensitivity,
        ));
    }

    // Swap. A leftover backup from an earlier run is discarded first.
    statements.push(Statement::new(
        DdlAction::DropSchema {
            name: backup.clone(),
            if_exists: true,
            cascade: true,
        },
        sensitivity,
    ));
    statements.push(Statement::new(
        DdlAction::CreateSchema {
            name: backup.clone(),
            owner: Some(owner.to_string()),
        },
        sensitivity,
    ));
    for table in &tables {
        statements.push(Statement::new(
            DdlAction::SetSchema {
                schema: schema.to_string(),
                table: table.to_string(),
                new_schema: backup.clone(),
            },
            sensitivity,
        ));
    }
    for table in &tables {
        statements.push(Statement::new(
            DdlAction::SetSchema {
                schema: working.clone(),
                table: table.to_string(),
                new_schema: schema.to_string(),
            },
            sensitivity,
        ));
    }
    statements.push(Statement::new(
        DdlAction::DropSchema {
            name: working,
            if_exists: false,
            cascade: true,
        },
        sensitivity,
    ));
    Ok(statements)
}

/// Drop statements for planned constraints.
///
/// NOT NULL on primary key columns is left to the primary key itself, since
/// PostgreSQL refuses to drop it while the key exists.
pub fn undo_constraint_statements(
    metadata: &SchemaMetadata,
    definitions: &[Definition],
    sensitivity: ErrorSensitivity,
) -> Result<Vec<Statement>, PlanningError> {
    let droppable: Vec<Definition> = definitions
        .iter()
        .filter(|d| match d {
            Definition::Constraint(c) if c.kind == ConstraintKind::NotNull => {
                let key_columns = metadata
                    .table(&c.table)
                    .and_then(|t| t.primary_key.as_ref())
                    .map(|pk| pk.columns.as_slice())
                    .unwrap_or_default();
                !c.columns.iter().all(|col| key_columns.contains(col))
            }
            _ => true,
        })
        .cloned()
        .collect();
    generate_drop(&droppable, sensitivity)
}

/// Recreate every data table of `schema` from the stock selection over
/// `<schema>_backup` and swap the copies into place.
///
/// The copies are built with strict sensitivity: the current tables are only
/// dropped once every copy exists.
pub fn undo_transform_statements(
    metadata: &SchemaMetadata,
    schema: &str,
    owner: &str,
    sensitivity: ErrorSensitivity,
) -> Vec<Statement> {
    let undo = undo_schema(schema);
    let backup = backup_schema(schema);
    let tables: Vec<_> = metadata.data_tables().collect();

    let mut statements = vec![
        Statement::new(
            DdlAction::DropSchema {
                name: undo.clone(),
                if_exists: true,
                cascade: true,
            },
            sensitivity,
        ),
        Statement::new(
            DdlAction::CreateSchema {
                name: undo.clone(),
                owner: Some(owner.to_string()),
            },
            sensitivity,
        ),
    ];
    for table in &tables {
        statements.push(Statement::new(
            DdlAction::CreateTableAs {
                schema: undo.clone(),
                table: table.name.clone(),
                select: Select::stock(table, Some(&backup)),
                unlogged: false,
            },
            ErrorSensitivity::Strict,
        ));
    }
    for table in &tables {
        statements.push(Statement::new(
            DdlAction::DropTable {
                schema: schema.to_string(),
                table: table.name.clone(),
                cascade: true,
            },
            sensitivity,
        ));
        statements.push(Statement::new(
            DdlAction::SetSchema {
                schema: undo.clone(),
                table: table.name.clone(),
                new_schema: schema.to_string(),
            },
            sensitivity,
        ));
    }
    statements.push(Statement::new(
        DdlAction::DropSchema {
            name: undo,
            if_exists: false,
            cascade: true,
        },
        sensitivity,
    ));
    statements
}

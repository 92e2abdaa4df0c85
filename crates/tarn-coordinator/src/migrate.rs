//! Bringing a file's schema in line with the one a realm asks for.
//!
//! Additive changes (new tables, new properties) are applied on open at any
//! schema version. Everything else needs a higher schema version; the
//! migration callback then runs after new tables, new properties and type
//! changes are in place, but before anything is removed, so it can still
//! read properties that are about to go away.

use tarn_store::{Snapshot, StoreError, VersionedStore, WriteTransaction};
use tarn_types::{ObjectSchema, Property, Schema, SchemaChange, Version};
use tracing::{debug, info};

use crate::config::RealmConfig;
use crate::error::{RealmError, RealmResult};

/// Make the file's schema equal to `config.schema`, migrating if needed.
/// Returns the version committed, if anything had to change.
pub(crate) fn prepare_schema(
    store: &VersionedStore,
    config: &RealmConfig,
) -> RealmResult<Option<Version>> {
    let Some(target) = &config.schema else {
        return Ok(None);
    };

    {
        let read = store.read_latest()?;
        match plan(read.schema(), read.schema_version(), target, config.schema_version)? {
            None => return Ok(None),
            Some(_) if config.read_only => {
                return Err(RealmError::SchemaMismatch(
                    "read-only file has a different schema".into(),
                ))
            }
            Some(_) => {}
        }
    }

    // Plan again under the write lock; another handle may have migrated.
    let mut txn = store.begin_write()?;
    let current = txn.schema().clone();
    let current_version = txn.schema_version();
    let Some(changes) = plan(&current, current_version, target, config.schema_version)? else {
        txn.cancel();
        return Ok(None);
    };
    info!(
        path = %config.path.display(),
        from = current_version,
        to = config.schema_version,
        changes = changes.len(),
        "updating schema"
    );

    add_tables(&mut txn, &changes)?;
    for change in &changes {
        match change {
            SchemaChange::AddProperty { table, property } => {
                txn.add_property(table, property.clone())?;
            }
            SchemaChange::ChangePropertyType { table, property, new, .. } => {
                txn.remove_property(table, property)?;
                txn.add_property(table, new.clone())?;
            }
            _ => {}
        }
    }

    if config.schema_version > current_version {
        if let Some(migration) = &config.migration {
            migration(current_version, config.schema_version, &mut txn)
                .map_err(RealmError::Migration)?;
        }
    }

    for change in &changes {
        match change {
            SchemaChange::RemoveProperty { table, property } => {
                txn.remove_property(table, property)?;
            }
            SchemaChange::ChangePrimaryKey { table, new, .. } => {
                txn.set_primary_key(table, new.as_deref())?;
            }
            _ => {}
        }
    }
    remove_tables(&mut txn, &changes)?;
    txn.set_schema_version(config.schema_version);

    let remaining = txn.schema().diff(target);
    if !remaining.is_empty() {
        txn.cancel();
        return Err(RealmError::SchemaMismatch(format!(
            "schema still differs after migration: {}",
            describe(&remaining[0])
        )));
    }
    let version = txn.commit()?;
    debug!(%version, "schema committed");
    Ok(Some(version))
}

/// The changes to apply, `None` if the schema already matches, or an error
/// if the change is not allowed at this schema version.
fn plan(
    current: &Schema,
    current_version: u64,
    target: &Schema,
    target_version: u64,
) -> RealmResult<Option<Vec<SchemaChange>>> {
    if target_version < current_version {
        return Err(RealmError::SchemaMismatch(format!(
            "requested schema version {target_version} is older than the file's {current_version}"
        )));
    }
    let changes = current.diff(target);
    if target_version == current_version {
        if changes.is_empty() {
            return Ok(None);
        }
        if let Some(change) = changes.iter().find(|c| !c.is_additive()) {
            return Err(RealmError::SchemaMismatch(format!(
                "{} requires a schema version bump",
                describe(change)
            )));
        }
    }
    Ok(Some(changes))
}

/// Add new tables. Link properties whose target does not exist yet are
/// added once every new table is in place.
fn add_tables(txn: &mut WriteTransaction, changes: &[SchemaChange]) -> RealmResult<()> {
    let mut deferred: Vec<(String, Property)> = Vec::new();
    for change in changes {
        let SchemaChange::AddTable(schema) = change else {
            continue;
        };
        let (ready, later): (Vec<Property>, Vec<Property>) =
            schema.properties.iter().cloned().partition(|p| {
                p.ty.link_target()
                    .map_or(true, |t| t == schema.name || txn.has_table(t))
            });
        let mut table = ObjectSchema::new(schema.name.clone(), ready);
        table.primary_key = schema.primary_key.clone();
        txn.add_table(table)?;
        deferred.extend(later.into_iter().map(|p| (schema.name.clone(), p)));
    }
    for (table, property) in deferred {
        txn.add_property(&table, property)?;
    }
    Ok(())
}

/// Remove tables, retrying those still linked from another table being
/// removed until no progress is made.
fn remove_tables(txn: &mut WriteTransaction, changes: &[SchemaChange]) -> RealmResult<()> {
    let mut pending: Vec<&str> = changes
        .iter()
        .filter_map(|c| match c {
            SchemaChange::RemoveTable(name) => Some(name.as_str()),
            _ => None,
        })
        .collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut last_error: Option<StoreError> = None;
        pending.retain(|table| match txn.remove_table(table) {
            Ok(()) => false,
            Err(err) => {
                last_error = Some(err);
                true
            }
        });
        if pending.len() == before {
            if let Some(err) = last_error {
                return Err(err.into());
            }
        }
    }
    Ok(())
}

fn describe(change: &SchemaChange) -> String {
    match change {
        SchemaChange::AddTable(schema) => format!("adding table {}", schema.name),
        SchemaChange::RemoveTable(table) => format!("removing table {table}"),
        SchemaChange::AddProperty { table, property } => {
            format!("adding {table}.{}", property.name)
        }
        SchemaChange::RemoveProperty { table, property } => format!("removing {table}.{property}"),
        SchemaChange::ChangePropertyType { table, property, .. } => {
            format!("changing the type of {table}.{property}")
        }
        SchemaChange::ChangePrimaryKey { table, .. } => {
            format!("changing the primary key of {table}")
        }
    }
}

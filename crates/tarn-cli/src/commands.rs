use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use colored::Colorize;
use serde_json::json;
use tarn_changeset::{Changeset, Instruction, TransactionLog};
use tarn_coordinator::{Realm, RealmConfig};
use tarn_fabric::EventLoop;
use tarn_notify::{ChangeEvent, Delta, Query};
use tarn_store::{ErrorKind, Snapshot, StoreError, VersionedStore};
use tarn_types::Version;
use tracing::debug;

use crate::cli::*;
use crate::config::CliConfig;

pub fn run_command(cli: Cli, out: &mut dyn Write) -> anyhow::Result<()> {
    let config = CliConfig::load(cli.config.as_deref())?;
    let format = cli.format;
    match cli.command {
        Command::Info(args) => cmd_info(&config, format, args, out),
        Command::Dump(args) => cmd_dump(&config, format, args, out),
        Command::History(args) => cmd_history(&config, format, args, out),
        Command::Diff(args) => cmd_diff(&config, format, args, out),
        Command::Compact(args) => cmd_compact(&config, format, args, out),
        Command::Watch(args) => cmd_watch(&config, format, args, out),
    }
}

fn open(config: &CliConfig, path: &Path) -> anyhow::Result<VersionedStore> {
    VersionedStore::open_read_only(path, config.store.clone())
        .with_context(|| format!("opening {}", path.display()))
}

fn print_json(out: &mut dyn Write, value: &serde_json::Value) -> anyhow::Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn cmd_info(
    config: &CliConfig,
    format: OutputFormat,
    args: InfoArgs,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let store = open(config, &args.path)?;
    let info = store.info()?;
    let read = store.read_latest()?;

    if format == OutputFormat::Json {
        return print_json(
            out,
            &json!({
                "path": info.path,
                "file_id": info.file_id,
                "version": info.version,
                "schema_version": info.schema_version,
                "committed_at": read.committed_at(),
                "file_len": info.file_len,
                "free_bytes": info.free_bytes,
                "retained_history": info.retained_history,
                "schema": read.schema(),
                "tables": info.tables.iter().map(|(name, rows)| json!({ "name": name, "rows": rows })).collect::<Vec<_>>(),
            }),
        );
    }

    writeln!(out, "{} {}", "Store".bold(), info.path.display())?;
    writeln!(out, "  File id:    {}", info.file_id.to_string().cyan())?;
    writeln!(
        out,
        "  Version:    {} (committed {})",
        info.version.to_string().yellow().bold(),
        read.committed_at().format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    writeln!(out, "  Schema:     version {}", info.schema_version)?;
    writeln!(
        out,
        "  Size:       {} bytes, {} free",
        info.file_len, info.free_bytes
    )?;
    writeln!(out, "  History:    {} transaction logs", info.retained_history)?;
    if info.tables.is_empty() {
        writeln!(out, "\nNo tables.")?;
        return Ok(());
    }
    writeln!(out)?;
    for (name, rows) in &info.tables {
        writeln!(out, "{} ({} objects)", name.green().bold(), rows)?;
        let schema = read.object_schema(name)?;
        for property in &schema.properties {
            let mut notes = Vec::new();
            if property.nullable {
                notes.push("nullable");
            }
            if schema.primary_key.as_deref() == Some(property.name.as_str()) {
                notes.push("primary key");
            }
            let notes = if notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", notes.join(", ")).dimmed().to_string()
            };
            writeln!(out, "  {}: {}{}", property.name, property.ty, notes)?;
        }
    }
    Ok(())
}

fn cmd_dump(
    config: &CliConfig,
    format: OutputFormat,
    args: DumpArgs,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let store = open(config, &args.path)?;
    let read = match args.version {
        Some(v) => store
            .read(Version::new(v))
            .with_context(|| format!("version {v} is not readable"))?,
        None => store.read_latest()?,
    };
    let tables = match args.table {
        Some(table) => {
            if !read.has_table(&table) {
                bail!("no table named {table}");
            }
            vec![table]
        }
        None => read.table_names(),
    };

    if format == OutputFormat::Json {
        let mut dump = serde_json::Map::new();
        for table in &tables {
            let schema = read.object_schema(table)?;
            let objects: Vec<serde_json::Value> = read
                .objects(table)?
                .into_iter()
                .map(|(key, values)| -> serde_json::Result<serde_json::Value> {
                    let fields = schema
                        .properties
                        .iter()
                        .zip(values)
                        .map(|(p, v)| serde_json::to_value(v).map(|v| (p.name.clone(), v)))
                        .collect::<serde_json::Result<serde_json::Map<_, _>>>()?;
                    Ok(json!({ "key": key.value(), "values": fields }))
                })
                .collect::<serde_json::Result<_>>()?;
            dump.insert(table.clone(), serde_json::Value::Array(objects));
        }
        return print_json(
            out,
            &json!({ "version": read.version(), "tables": dump }),
        );
    }

    writeln!(out, "At {}", read.version().to_string().yellow().bold())?;
    for table in &tables {
        let schema = read.object_schema(table)?;
        writeln!(out, "\n{}", table.green().bold())?;
        let objects = read.objects(table)?;
        if objects.is_empty() {
            writeln!(out, "  (empty)")?;
        }
        for (key, values) in objects {
            let fields: Vec<String> = schema
                .properties
                .iter()
                .zip(&values)
                .map(|(p, v)| format!("{}={v}", p.name))
                .collect();
            writeln!(out, "  {} {}", key.to_string().cyan(), fields.join(" "))?;
        }
    }
    Ok(())
}

/// Retained logs, newest first, stopping at the first version whose log
/// has been reclaimed.
fn retained_logs(store: &VersionedStore, limit: usize) -> anyhow::Result<Vec<TransactionLog>> {
    let mut logs = Vec::new();
    let mut version = store.latest_version()?;
    while logs.len() < limit {
        let Some(prev) = version.prev() else {
            break;
        };
        match store.transaction_logs(prev, version) {
            Ok(mut found) => logs.append(&mut found),
            Err(StoreError::VersionNotAvailable(_)) => break,
            Err(err) => return Err(err.into()),
        }
        version = prev;
    }
    debug!(logs = logs.len(), "history collected");
    Ok(logs)
}

fn describe(instruction: &Instruction) -> String {
    match instruction {
        Instruction::AddTable { schema } => format!("add table {}", schema.name),
        Instruction::RemoveTable { table } => format!("remove table {table}"),
        Instruction::AddProperty { table, property, .. } => {
            format!("add {table}.{}: {}", property.name, property.ty)
        }
        Instruction::RemoveProperty { table, property } => format!("remove {table}.{property}"),
        Instruction::CreateObject { table, key, .. } => format!("create {table} {key}"),
        Instruction::EraseObject { table, key, .. } => format!("erase {table} {key}"),
        Instruction::Set {
            table,
            key,
            property,
            old,
            new,
        } => format!("set {table} {key}.{property}: {old} -> {new}"),
        Instruction::ListInsert {
            table,
            key,
            property,
            index,
            value,
        } => format!("insert {table} {key}.{property}[{index}] = {value}"),
        Instruction::ListSet {
            table,
            key,
            property,
            index,
            old,
            new,
        } => format!("set {table} {key}.{property}[{index}]: {old} -> {new}"),
        Instruction::ListErase {
            table,
            key,
            property,
            index,
            ..
        } => format!("erase {table} {key}.{property}[{index}]"),
        Instruction::ListMove {
            table,
            key,
            property,
            from,
            to,
        } => format!("move {table} {key}.{property}[{from}] -> [{to}]"),
        Instruction::ListClear {
            table,
            key,
            property,
            old,
        } => format!("clear {table} {key}.{property} ({} items)", old.len()),
    }
}

fn cmd_history(
    config: &CliConfig,
    format: OutputFormat,
    args: HistoryArgs,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let store = open(config, &args.path)?;
    let logs = retained_logs(&store, args.limit)?;

    if format == OutputFormat::Json {
        return print_json(out, &serde_json::to_value(&logs)?);
    }
    if logs.is_empty() {
        writeln!(out, "No retained history.")?;
        return Ok(());
    }
    for log in &logs {
        writeln!(
            out,
            "{}  {}  {} records",
            log.version.to_string().yellow().bold(),
            log.committed_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            log.records.len()
        )?;
        if args.records {
            for record in &log.records {
                writeln!(out, "  {:>4} {}", record.seq, describe(&record.instruction))?;
            }
        }
    }
    Ok(())
}

fn changeset_json(changeset: &Changeset) -> serde_json::Value {
    let tables: serde_json::Map<String, serde_json::Value> = changeset
        .tables
        .iter()
        .map(|(name, t)| {
            let modifications: serde_json::Map<String, serde_json::Value> = t
                .modifications
                .iter()
                .map(|(key, props)| (key.value().to_string(), json!(props)))
                .collect();
            (
                name.clone(),
                json!({
                    "added": t.added,
                    "removed": t.removed,
                    "schema_changed": t.schema_changed,
                    "insertions": t.insertions.iter().map(|k| k.value()).collect::<Vec<_>>(),
                    "deletions": t.deletions.iter().map(|k| k.value()).collect::<Vec<_>>(),
                    "modifications": modifications,
                }),
            )
        })
        .collect();
    json!({
        "from": changeset.from,
        "to": changeset.to,
        "records": changeset.len(),
        "tables": tables,
    })
}

fn cmd_diff(
    config: &CliConfig,
    format: OutputFormat,
    args: DiffArgs,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let store = open(config, &args.path)?;
    let from = Version::new(args.from);
    let to = match args.to {
        Some(v) => Version::new(v),
        None => store.latest_version()?,
    };
    let changeset = store
        .changeset(from, to)
        .with_context(|| format!("no history between {from} and {to}"))?;

    if format == OutputFormat::Json {
        return print_json(out, &changeset_json(&changeset));
    }
    writeln!(
        out,
        "{} {} → {} ({} records)",
        "Diff".bold(),
        from.to_string().yellow(),
        to.to_string().yellow(),
        changeset.len()
    )?;
    if changeset.tables.is_empty() {
        writeln!(out, "\nNo changes.")?;
        return Ok(());
    }
    for (name, t) in &changeset.tables {
        let mut flags = Vec::new();
        if t.added {
            flags.push("added");
        }
        if t.removed {
            flags.push("removed");
        }
        if t.schema_changed {
            flags.push("schema changed");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        writeln!(out, "\n{}{}", name.bold(), flags)?;
        for key in &t.insertions {
            writeln!(out, "  {} {key}", "+".green())?;
        }
        for key in &t.deletions {
            writeln!(out, "  {} {key}", "-".red())?;
        }
        for (key, properties) in &t.modifications {
            let properties: Vec<&str> = properties.iter().map(String::as_str).collect();
            writeln!(out, "  {} {key} {}", "~".yellow(), properties.join(", "))?;
        }
    }
    Ok(())
}

fn cmd_compact(
    config: &CliConfig,
    format: OutputFormat,
    args: CompactArgs,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let store = open(config, &args.path)?;
    let before = store.info()?.file_len;
    store
        .write_copy(&args.dest)
        .with_context(|| format!("writing {}", args.dest.display()))?;
    let copy = open(config, &args.dest)?.info()?;

    if format == OutputFormat::Json {
        return print_json(
            out,
            &json!({
                "source": args.path,
                "dest": args.dest,
                "version": copy.version,
                "before": before,
                "after": copy.file_len,
            }),
        );
    }
    writeln!(
        out,
        "{} Wrote {} at {} ({} → {} bytes)",
        "✓".green().bold(),
        args.dest.display(),
        copy.version.to_string().yellow(),
        before,
        copy.file_len
    )?;
    Ok(())
}

fn render_event(format: OutputFormat, event: &ChangeEvent) -> anyhow::Result<String> {
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string(event)?);
    }
    Ok(match event {
        ChangeEvent::Initial { version } => format!("{} initial", version.to_string().yellow()),
        ChangeEvent::Update {
            version,
            delta: Delta::Collection(delta),
        } => {
            let list = |set: &tarn_notify::IndexSet| {
                set.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
            };
            format!(
                "{} {} [{}] {} [{}] {} [{}]",
                version.to_string().yellow(),
                "+".green(),
                list(&delta.insertions),
                "-".red(),
                list(&delta.deletions),
                "~".yellow(),
                list(&delta.modifications_new)
            )
        }
        ChangeEvent::Update {
            version,
            delta: Delta::Object(change),
        } => {
            let properties: Vec<&str> = change.properties.iter().map(String::as_str).collect();
            format!("{} ~ {}", version.to_string().yellow(), properties.join(", "))
        }
        ChangeEvent::Invalidated { version } => {
            format!("{} {}", version.to_string().yellow(), "invalidated".red().bold())
        }
    })
}

fn cmd_watch(
    config: &CliConfig,
    format: OutputFormat,
    args: WatchArgs,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let event_loop = EventLoop::new();
    let realm_config = RealmConfig::new(&args.path)
        .with_store_config(config.store.clone())
        .with_signal(config.signal)
        .read_only();
    let realm = Realm::open(realm_config, event_loop.scheduler()).map_err(|err| {
        if err.kind() == ErrorKind::InvalidFile {
            anyhow::anyhow!("{} is not a store file: {err}", args.path.display())
        } else {
            anyhow::Error::new(err)
        }
    })?;

    let events: Arc<Mutex<Vec<ChangeEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    let _token = realm.observe_results(Query::table(&args.table), move |event| {
        sink.lock().expect("lock poisoned").push(event.clone());
    })?;

    let deadline = args
        .timeout
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut seen = 0;
    loop {
        let slice = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left.min(Duration::from_secs(1)),
                None => break,
            },
            None => Duration::from_secs(1),
        };
        event_loop.run_until(slice, || !events.lock().expect("lock poisoned").is_empty());
        let batch: Vec<ChangeEvent> = std::mem::take(&mut *events.lock().expect("lock poisoned"));
        for event in &batch {
            writeln!(out, "{}", render_event(format, event)?)?;
            seen += 1;
            if event.is_terminal() || args.count.is_some_and(|count| seen >= count) {
                out.flush()?;
                return Ok(());
            }
        }
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tarn_store::StoreConfig;
    use tarn_types::{ObjectSchema, Property, PropertyType, Schema, Value};

    fn seeded(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("db.tarn");
        let schema = Schema::new(vec![ObjectSchema::new(
            "Dog",
            vec![
                Property::new("name", PropertyType::String),
                Property::new("age", PropertyType::Int),
            ],
        )]);
        let store =
            VersionedStore::open_with_schema(&path, StoreConfig::ephemeral(), &schema, 1).unwrap();
        let mut txn = store.begin_write().unwrap();
        txn.create_object("Dog", vec![Value::from("rex"), Value::from(3)])
            .unwrap();
        txn.commit().unwrap();
        let mut txn = store.begin_write().unwrap();
        let key = txn.keys("Dog").unwrap()[0];
        txn.set("Dog", key, "age", Value::from(4)).unwrap();
        txn.commit().unwrap();
        path
    }

    fn run_json(args: &[&str]) -> serde_json::Value {
        let mut argv = vec!["tarn", "--format", "json"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        let mut out = Vec::new();
        run_command(cli, &mut out).unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn info_reports_tables_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir);
        let info = run_json(&["info", path.to_str().unwrap()]);
        assert_eq!(info["version"], json!(2));
        assert_eq!(info["schema_version"], json!(1));
        assert_eq!(info["tables"][0]["name"], json!("Dog"));
        assert_eq!(info["tables"][0]["rows"], json!(1));
    }

    #[test]
    fn dump_names_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir);
        let dump = run_json(&["dump", path.to_str().unwrap(), "--table", "Dog"]);
        let dogs = dump["tables"]["Dog"].as_array().unwrap();
        assert_eq!(dogs.len(), 1);
        assert_eq!(dogs[0]["values"]["age"], json!({ "Int": 4 }));
    }

    #[test]
    fn history_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir);
        let history = run_json(&["history", path.to_str().unwrap()]);
        let versions: Vec<u64> = history
            .as_array()
            .unwrap()
            .iter()
            .map(|log| log["version"].as_u64().unwrap())
            .collect();
        assert_eq!(versions, vec![2, 1]);
    }

    #[test]
    fn diff_folds_create_and_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir);
        let diff = run_json(&["diff", path.to_str().unwrap(), "0"]);
        assert_eq!(diff["records"], json!(2));
        assert_eq!(diff["tables"]["Dog"]["insertions"].as_array().unwrap().len(), 1);
        assert!(diff["tables"]["Dog"]["modifications"]
            .as_object()
            .unwrap()
            .is_empty());

        let later = run_json(&["diff", path.to_str().unwrap(), "1", "2"]);
        let modified = later["tables"]["Dog"]["modifications"].as_object().unwrap();
        assert_eq!(modified.values().next().unwrap(), &json!(["age"]));
    }

    #[test]
    fn compact_keeps_the_latest_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir);
        let dest = dir.path().join("copy.tarn");
        let result = run_json(&["compact", path.to_str().unwrap(), dest.to_str().unwrap()]);
        assert_eq!(result["version"], json!(2));
        let copy = VersionedStore::open_read_only(&dest, StoreConfig::ephemeral()).unwrap();
        assert_eq!(copy.read_latest().unwrap().len("Dog").unwrap(), 1);
    }

    #[test]
    fn watch_prints_the_initial_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(&dir);
        let cli = Cli::try_parse_from([
            "tarn",
            "--format",
            "json",
            "watch",
            path.to_str().unwrap(),
            "Dog",
            "--count",
            "1",
            "--timeout",
            "5",
        ])
        .unwrap();
        let mut out = Vec::new();
        run_command(cli, &mut out).unwrap();
        let event: ChangeEvent = serde_json::from_slice(&out).unwrap();
        assert_eq!(event, ChangeEvent::Initial { version: Version::new(2) });
    }
}

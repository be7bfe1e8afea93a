use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metarepo_core::{AssociationEnd, DeletionPlan, ObjectRef, PersistentId};
use metarepo_store_sqlite::{RepositoryConfig, SqliteStore};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "mr.v1";

#[derive(Debug, Parser)]
#[command(name = "mr")]
#[command(about = "Metadata repository CLI")]
struct Cli {
    #[arg(long, default_value = "./metarepo.sqlite3")]
    db: PathBuf,

    /// Repository config (YAML, or JSON with a `.json` extension).
    #[arg(long, default_value = "./metarepo.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Object {
        #[command(subcommand)]
        command: ObjectCommand,
    },
    Delete {
        #[command(subcommand)]
        command: DeleteCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ObjectCommand {
    Create(CreateArgs),
    Link(LinkArgs),
    Children(ChildrenArgs),
    List(ListArgs),
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long = "type")]
    type_name: String,
    #[arg(long, default_value = "")]
    name: String,
}

#[derive(Debug, Args)]
struct LinkArgs {
    #[arg(long)]
    association: String,
    #[arg(long)]
    parent: i64,
    #[arg(long)]
    child: i64,
}

#[derive(Debug, Args)]
struct ChildrenArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    association: String,
    #[arg(long, value_enum, default_value_t = EndArg::Parent)]
    end: EndArg,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long = "type")]
    type_name: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EndArg {
    Parent,
    Child,
}

impl From<EndArg> for AssociationEnd {
    fn from(value: EndArg) -> Self {
        match value {
            EndArg::Parent => Self::Parent,
            EndArg::Child => Self::Child,
        }
    }
}

#[derive(Debug, Subcommand)]
enum DeleteCommand {
    /// Print the deletion plan. Pending schema migrations are applied first; no object is touched.
    Plan(DeleteArgs),
    /// Delete the objects and everything they compositely own.
    Apply(DeleteArgs),
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long = "id", required = true, num_args = 1..)]
    ids: Vec<i64>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RepositoryConfig::load(&cli.config)?;
    tracing::debug!(
        db = %cli.db.display(),
        config = %cli.config.display(),
        classes = config.metamodel.classes.len(),
        associations = config.metamodel.associations.len(),
        "opening repository"
    );
    let mut store = SqliteStore::open(&cli.db, config)?;
    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Object { command } => run_object(command, &mut store),
        Command::Delete { command } => run_delete(command, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "missing_class_tables": status.missing_class_tables,
        "up_to_date": status.pending_versions.is_empty() && status.missing_class_tables.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "would_create_tables": before.missing_class_tables
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "created_tables": before.missing_class_tables,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty() && after.missing_class_tables.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    let clean = report.is_clean();
    let mut value = serde_json::to_value(&report).context("failed to serialize integrity report")?;
    if let Value::Object(object) = &mut value {
        object.insert("clean".to_string(), Value::Bool(clean));
    }
    emit_json(value)
}

fn run_object(command: ObjectCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        ObjectCommand::Create(args) => {
            let record = store.create_object(&args.type_name, &args.name)?;
            emit_json(serde_json::to_value(&record).context("failed to serialize object record")?)
        }
        ObjectCommand::Link(args) => {
            let parent = store.resolve(PersistentId(args.parent))?;
            let child = store.resolve(PersistentId(args.child))?;
            let instance = store.link(&args.association, &parent, &child)?;
            emit_json(serde_json::json!({
                "association": args.association,
                "instance_id": instance,
                "parent": parent,
                "child": child,
            }))
        }
        ObjectCommand::Children(args) => {
            let object = store.resolve(PersistentId(args.id))?;
            let end = AssociationEnd::from(args.end);
            let related = store.related(&object, &args.association, end)?;
            emit_json(serde_json::json!({
                "object": object,
                "association": args.association,
                "end": end.as_str(),
                "related": related,
            }))
        }
        ObjectCommand::List(args) => {
            let objects = store.list_objects(&args.type_name)?;
            emit_json(serde_json::json!({ "type": args.type_name, "objects": objects }))
        }
    }
}

fn run_delete(command: DeleteCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        DeleteCommand::Plan(args) => {
            let requested = resolve_all(store, &args.ids)?;
            let plan = store.plan_deletion(&requested)?;
            emit_json(serde_json::json!({
                "applied": false,
                "requested": requested,
                "summary": plan_summary(&plan),
                "plan": plan,
            }))
        }
        DeleteCommand::Apply(args) => {
            let requested = resolve_all(store, &args.ids)?;
            let outcome = store.delete_objects(&requested)?;
            emit_json(serde_json::json!({
                "applied": true,
                "requested": requested,
                "summary": plan_summary(&outcome.plan),
                "plan": outcome.plan,
                "report": outcome.report,
            }))
        }
    }
}

fn resolve_all(store: &SqliteStore, ids: &[i64]) -> Result<Vec<ObjectRef>> {
    ids.iter().map(|id| store.resolve(PersistentId(*id))).collect()
}

fn plan_summary(plan: &DeletionPlan) -> Value {
    serde_json::json!({
        "objects": plan.object_count(),
        "associations": plan.association_count(),
        "fix_ups": plan.fix_up_count(),
    })
}

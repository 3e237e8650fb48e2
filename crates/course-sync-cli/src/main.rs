use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use course_sync_api::{CourseSyncApi, PassReport};
use course_sync_core::{ErrorPolicy, SyncConfig, SyncError};
use course_sync_store_sqlite::NewCourse;
use serde_json::Value;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod report;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const COMMAND_FAILURE_EXIT: u8 = 3;
const LOCAL_STORE_FAILURE_EXIT: u8 = 5;

#[derive(Debug, Parser)]
#[command(name = "csync")]
#[command(about = "Course name synchronisation CLI")]
struct Cli {
    #[arg(long, default_value = "./course_sync.sqlite3")]
    db: PathBuf,

    /// Sync configuration file. Without one every pass is skipped.
    #[arg(long, env = "COURSE_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive; overrides `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Sync(SyncArgs),
    Source {
        #[command(subcommand)]
        command: SourceCommand,
    },
    Course {
        #[command(subcommand)]
        command: CourseCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Record failed updates against their row and keep going.
    #[arg(long, default_value_t = false)]
    continue_on_error: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Table,
}

#[derive(Debug, Subcommand)]
enum SourceCommand {
    Show(SourceShowArgs),
}

#[derive(Debug, Args)]
struct SourceShowArgs {
    #[arg(long)]
    id_number: String,
}

#[derive(Debug, Subcommand)]
enum CourseCommand {
    Add(CourseAddArgs),
    List,
}

#[derive(Debug, Args)]
struct CourseAddArgs {
    #[arg(long)]
    full_name: String,
    #[arg(long)]
    short_name: String,
    #[arg(long, default_value = "")]
    id_number: String,
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
enum ConfigCommand {
    Check,
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

fn emit_failure(kind: &str, message: &str, exit_code: u8) -> Result<ExitCode> {
    emit_json(serde_json::json!({
        "error_kind": kind,
        "message": message,
        "exit_code": exit_code
    }))?;
    Ok(ExitCode::from(exit_code))
}

fn emit_sync_error(err: &SyncError) -> Result<ExitCode> {
    emit_failure(err.kind(), &err.to_string(), err.exit_code())
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid --log-level directive `{directive}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig, SyncError> {
    path.map_or_else(|| Ok(SyncConfig::default()), SyncConfig::load)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            let message = format!("{err:#}");
            error!(error = %message, "command failed");
            emit_failure("command", &message, COMMAND_FAILURE_EXIT)
                .unwrap_or(ExitCode::from(COMMAND_FAILURE_EXIT))
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    init_tracing(cli.log_level.as_deref())?;

    let api = CourseSyncApi::new(cli.db.clone());
    let config = cli.config.as_deref();
    match cli.command {
        Command::Sync(args) => run_sync(&api, config, &args),
        Command::Source { command } => run_source(&api, config, &command),
        Command::Course { command } => run_course(&api, command),
        Command::Db { command } => run_db(&api, &command),
        Command::Config { command } => run_config(config, &command),
    }
}

fn run_sync(api: &CourseSyncApi, config_path: Option<&Path>, args: &SyncArgs) -> Result<ExitCode> {
    let policy = if args.continue_on_error { ErrorPolicy::Continue } else { ErrorPolicy::FailFast };

    let pass = match load_config(config_path) {
        Ok(config) => match api.run_pass(&config, policy) {
            Ok(pass) => pass,
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "local course store unavailable");
                return emit_failure("store", &message, LOCAL_STORE_FAILURE_EXIT);
            }
        },
        Err(err) => PassReport::rejected(&err, policy),
    };

    match args.format {
        OutputFormat::Json => emit_json(serde_json::to_value(&pass)?)?,
        OutputFormat::Table => print!("{}", report::render_table(&pass)),
    }
    Ok(ExitCode::from(pass.exit_code))
}

fn run_source(
    api: &CourseSyncApi,
    config_path: Option<&Path>,
    command: &SourceCommand,
) -> Result<ExitCode> {
    match command {
        SourceCommand::Show(args) => {
            let records = load_config(config_path)
                .and_then(|config| api.show_source(&config, &args.id_number));
            match records {
                Ok(records) => {
                    emit_json(serde_json::json!({
                        "id_number": args.id_number,
                        "records": records
                    }))?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => emit_sync_error(&err),
            }
        }
    }
}

fn run_course(api: &CourseSyncApi, command: CourseCommand) -> Result<ExitCode> {
    match command {
        CourseCommand::Add(args) => {
            let course = api.add_course(&NewCourse {
                full_name: args.full_name,
                short_name: args.short_name,
                id_number: args.id_number,
            })?;
            emit_json(serde_json::to_value(course)?)?;
        }
        CourseCommand::List => {
            let courses = api.list_courses()?;
            emit_json(serde_json::json!({ "courses": courses }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_db(api: &CourseSyncApi, command: &DbCommand) -> Result<ExitCode> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))?;
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)?;
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(report)?)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_config(config_path: Option<&Path>, command: &ConfigCommand) -> Result<ExitCode> {
    match command {
        ConfigCommand::Check => {
            let validated =
                load_config(config_path).and_then(|config| CourseSyncApi::check_config(&config));
            let validated = match validated {
                Ok(validated) => validated,
                Err(err) => return emit_sync_error(&err),
            };
            let select_list =
                validated.fields.select_list().into_iter().map(str::to_string).collect::<Vec<_>>();
            emit_json(serde_json::json!({
                "table": validated.table,
                "fields": validated.fields,
                "select_list": select_list,
                "source": {
                    "path": validated.source.path,
                    "encoding": validated.codec.name(),
                    "setup_sql": validated.source.setup_sql,
                    "debug": validated.source.debug
                }
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

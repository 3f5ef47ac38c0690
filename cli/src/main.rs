use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keel_cli::{build_request, log_follow_ups, parse_conditions, Outcome, Session, Verb};
use keel_engine::EngineConfig;
use keel_types::UserContext;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "keel", about = "Metadata-driven entity writes over SQLite")]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine settings file (TOML with an `[engine]` table)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a registry document
    Check { registry: PathBuf },
    /// Run one create, update or delete and print the written record tree
    Apply {
        #[command(flatten)]
        target: Target,

        #[arg(long, value_enum)]
        action: Verb,

        /// Primary key of the row to update or delete
        #[arg(long)]
        id: Option<String>,

        /// JSON object, or @path to a file holding one
        #[arg(long)]
        payload: Option<String>,
    },
    /// List the rows the caller may read
    List {
        #[command(flatten)]
        target: Target,

        /// JSON array of {field, operator, value} conditions
        #[arg(long = "where")]
        conditions: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Registry document (JSON)
    #[arg(long)]
    registry: PathBuf,

    /// SQLite database file
    #[arg(long)]
    db: PathBuf,

    #[arg(long)]
    entity: String,

    /// Caller id
    #[arg(long, default_value = "cli")]
    user: String,

    /// Caller role; repeat for several
    #[arg(long = "role")]
    roles: Vec<String>,
}

impl Target {
    fn user(&self) -> UserContext {
        UserContext::new(self.user.clone(), self.roles.iter().cloned())
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = args.config.as_deref().map(EngineConfig::load_from).unwrap_or_default();

    match args.command {
        Command::Check { registry } => {
            let report = keel_cli::check(&registry)?;
            info!("Registry {} is valid", registry.display());
            print_json(&serde_json::to_value(&report)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Apply { target, action, id, payload } => {
            let request = build_request(&target.entity, action, id.as_deref(), payload.as_deref(), target.user())?;
            let (session, follow_ups) = Session::open(&target.registry, &target.db, config)?;
            let logger = tokio::spawn(log_follow_ups(follow_ups));

            let outcome = session.apply(request)?;
            drop(session);
            let delivered = logger.await.context("Follow-up logger failed")?;
            info!("{} follow-up(s) queued", delivered);
            finish(outcome)
        }
        Command::List { target, conditions } => {
            let conditions = conditions.as_deref().map(parse_conditions).transpose()?.unwrap_or_default();
            let (session, _follow_ups) = Session::open(&target.registry, &target.db, config)?;
            let outcome = session.list(&target.entity, &target.user(), &conditions)?;
            finish(outcome)
        }
    }
}

fn finish(outcome: Outcome) -> Result<ExitCode> {
    print_json(&outcome.body)?;
    Ok(if outcome.ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

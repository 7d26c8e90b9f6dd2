use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cmagent::config::NodeAttributes;
use cmagent::converge::{AgentStatus, ConvergeReport, Converger};
use cmagent::host::{DryRunHost, Platform, SystemHost};
use cmagent::monitoring::{Credentials, MonitoringClient};
use cmagent::provision;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Install and configure the Rackspace Cloud Monitoring agent
#[derive(Parser, Debug)]
#[command(name = "cmagent", version = cmagent::VERSION, about, long_about = None)]
struct Args {
    /// Node attributes file (JSON, or YAML with a .yaml/.yml extension)
    #[arg(short, long, global = true)]
    attributes: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Serve the monitoring API from an in-memory fixture
    #[arg(long, global = true)]
    mock: bool,

    /// API username (overrides attributes and RACKSPACE_USERNAME)
    #[arg(long, global = true)]
    username: Option<String>,

    /// API key (overrides attributes and RACKSPACE_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Identity endpoint (overrides attributes and RACKSPACE_AUTH_URL)
    #[arg(long, global = true)]
    auth_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Converge this host: repository, agent token, config, package, service, plugins
    Converge {
        /// Log host changes instead of making them (the API is still consulted)
        #[arg(long)]
        dry_run: bool,
    },
    /// Find or create the agent token for a label
    Token {
        /// Token label, defaults to the node hostname
        #[arg(long)]
        label: Option<String>,
    },
    /// Find or create a monitoring entity
    Entity {
        #[arg(long)]
        label: String,
    },
    /// Find or create an alarm on an entity (the entity is created if missing)
    Alarm {
        /// Label of the owning entity
        #[arg(long)]
        entity: String,
        #[arg(long)]
        label: String,
        #[arg(long)]
        check_id: String,
        #[arg(long)]
        notification_plan_id: String,
    },
    /// Show the agent id recorded in node attributes
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(
    level: LogLevel,
    log_file: Option<&PathBuf>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(tracing_level.as_str().to_lowercase()));

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
        return Ok(None);
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {:?}", parent))?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {:?}", log_path))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("cmagent {} started with log level: {:?}", cmagent::VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn load_attributes(args: &Args) -> Result<NodeAttributes> {
    let path = args
        .attributes
        .clone()
        .or_else(NodeAttributes::default_path)
        .context("No attributes file given and no config directory available")?;
    NodeAttributes::load(&path)
}

/// Credentials from attributes and environment, with CLI flags on top
fn resolve_credentials(args: &Args, node: &NodeAttributes) -> Result<Credentials> {
    let mut credentials = Credentials::resolve(node, None)?;

    if let Some(username) = &args.username {
        credentials = credentials.with_username(username);
    }
    if let Some(api_key) = &args.api_key {
        credentials = credentials.with_api_key(api_key);
    }
    if let Some(auth_url) = &args.auth_url {
        credentials = credentials.with_auth_url(auth_url)?;
    }
    if args.mock {
        credentials = credentials.with_mock(true);
    }

    Ok(credentials)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level, args.log_file.as_ref())?;

    let mut node = load_attributes(&args)?;

    match &args.command {
        Command::Converge { dry_run } => {
            let credentials = resolve_credentials(&args, &node)?;
            let client = MonitoringClient::new(credentials)?;
            let platform = Platform::detect();

            let report = if *dry_run {
                Converger::new(&client, &DryRunHost, platform)
                    .converge(&mut node)
                    .await?
            } else {
                let host = SystemHost::new(platform.clone());
                Converger::new(&client, &host, platform)
                    .converge(&mut node)
                    .await?
            };

            node.save()?;
            print_report(&report);
        }
        Command::Token { label } => {
            let label = match label {
                Some(label) => label.clone(),
                None => node.hostname().context("Cannot determine hostname, pass --label")?,
            };
            let credentials = resolve_credentials(&args, &node)?;
            let token = provision::get_or_create_token(Some(&credentials), &label).await?;
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
        Command::Entity { label } => {
            let credentials = resolve_credentials(&args, &node)?;
            let entity = provision::get_or_create_entity(Some(&credentials), label).await?;
            println!("{}", serde_json::to_string_pretty(&entity)?);
        }
        Command::Alarm {
            entity,
            label,
            check_id,
            notification_plan_id,
        } => {
            let credentials = resolve_credentials(&args, &node)?;
            let client = MonitoringClient::new(credentials)?;
            let entity = provision::find_or_create_entity(&client, entity).await?;
            let alarm =
                provision::get_or_create_alarm(&client, &entity, label, check_id, notification_plan_id)
                    .await?;
            println!("{}", serde_json::to_string_pretty(&alarm)?);
        }
        Command::Show => {
            println!("id:    {}", node.agent_id().unwrap_or("<unset>"));
            println!(
                "token: {}",
                if node.agent_token().is_some() { "<set>" } else { "<unset>" }
            );
            if let Some(path) = node.path() {
                println!("attributes: {}", path.display());
            }
        }
    }

    Ok(())
}

fn print_report(report: &ConvergeReport) {
    match &report.agent {
        AgentStatus::Configured { id } => println!("Agent configured with id {}", id),
        AgentStatus::Skipped { reason } => println!("Agent not configured: {}", reason),
    }
    if report.provisioned {
        println!("Agent token resolved through the monitoring API");
    }
    if report.changes.is_empty() {
        println!("No changes");
    } else {
        for change in &report.changes {
            println!("  changed {}", change);
        }
    }
}

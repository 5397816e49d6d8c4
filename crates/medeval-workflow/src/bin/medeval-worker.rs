//! medeval-worker: maintenance loop and operator commands for the annotation
//! workflow.
//!
//! Usage:
//!   medeval-worker run
//!   medeval-worker seed --task-type ExamCoronaryCTA --count 200 --round 1
//!   medeval-worker qc --audit-rate 0.1 --seed 7
//!   medeval-worker report --json

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use medeval_db::{log_pool_metrics, Database, PoolConfig};
use medeval_workflow::{
    AdjudicationRequest, EvaluationReporter, MaintenanceWorker, QcPipeline, Round,
    SeedAssignmentsRequest, Seeder, WorkerConfig, WorkerEvent, WorkflowConfig,
};

#[derive(Parser)]
#[command(name = "medeval-worker")]
#[command(author, version, about = "Annotation workflow maintenance for medeval")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the maintenance loop until Ctrl-C
    Run,

    /// Create Ready assignments for one or more task types
    Seed {
        /// Task types to seed (repeatable)
        #[arg(short, long = "task-type", required = true, num_args = 1..)]
        task_types: Vec<String>,

        /// Cases per task type
        #[arg(short, long)]
        count: usize,

        /// Review round (1 or 2)
        #[arg(short, long, default_value = "1", value_parser = parse_round)]
        round: Round,

        /// Also consider cases that already have an assignment for the round
        #[arg(long)]
        include_seeded: bool,
    },

    /// Return expired leases to Ready
    Recycle,

    /// Run one QC convergence scan
    Qc {
        /// Restrict to these task types (repeatable)
        #[arg(short, long = "task-type")]
        task_types: Vec<String>,

        /// Maximum cases scanned in the first pass
        #[arg(long)]
        max_cases: Option<usize>,

        /// Audit probability for agreeing cases (default: QC_AUDIT_RATE)
        #[arg(long)]
        audit_rate: Option<f64>,

        /// Disable audit sampling
        #[arg(long)]
        no_audit: bool,

        /// Seed for audit sampling (default: QC_RNG_SEED)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Manually set a case's gold label
    Adjudicate {
        /// Adjudicator login name
        #[arg(short, long)]
        adjudicator: String,

        #[arg(long)]
        case_id: Uuid,

        #[arg(long)]
        task_type: String,

        /// Final label
        #[arg(short, long)]
        label: String,

        #[arg(short, long)]
        note: Option<String>,
    },

    /// List cases waiting on adjudication
    Pending {
        #[arg(long)]
        task_type: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print the evaluation report
    Report {
        /// Restrict to these task types (repeatable)
        #[arg(short, long = "task-type")]
        task_types: Vec<String>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn parse_round(s: &str) -> Result<Round, String> {
    let value: i16 = s.parse().map_err(|_| format!("invalid round: {s}"))?;
    Round::try_from(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "medeval_workflow=info,medeval_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "medeval_workflow=info,medeval_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("medeval-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    let config = WorkflowConfig::from_env();

    info!("Connecting to database...");
    let db = Database::connect_with_config(&config.database_url, PoolConfig::from_env()).await?;
    info!("Running database migrations...");
    db.migrate().await?;
    log_pool_metrics(db.pool());

    let repos = db.repositories();
    let qc = QcPipeline::new(repos.clone()).with_normalizer(config.normalizer());

    match cli.command {
        Commands::Run => {
            let worker = MaintenanceWorker::new(repos, WorkerConfig::from_workflow(&config))
                .with_qc(qc);
            let handle = worker.start();
            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            let mut events = handle.events();
            handle.shutdown().await?;
            while let Ok(event) = events.recv().await {
                if matches!(event, WorkerEvent::WorkerStopped) {
                    break;
                }
            }
        }
        Commands::Seed {
            task_types,
            count,
            round,
            include_seeded,
        } => {
            let result = Seeder::new(repos)
                .seed(&SeedAssignmentsRequest {
                    per_task_type_count: count,
                    task_types,
                    round,
                    exclude_already_seeded: !include_seeded,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Recycle => {
            let recycled = Seeder::new(repos)
                .recycle_expired(chrono::Utc::now())
                .await?;
            println!("recycled: {recycled}");
        }
        Commands::Qc {
            task_types,
            max_cases,
            audit_rate,
            no_audit,
            seed,
        } => {
            let mut req = config.qc_request();
            req.task_types = task_types;
            req.max_cases = max_cases;
            if let Some(rate) = audit_rate {
                req.audit_rate = rate.clamp(0.0, 1.0);
            }
            if no_audit {
                req.create_audit_assignments = false;
            }
            req.rng_seed = seed.or(req.rng_seed);
            let result = qc.run(&req).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Adjudicate {
            adjudicator,
            case_id,
            task_type,
            label,
            note,
        } => {
            let result = qc
                .adjudicate(
                    &adjudicator,
                    &AdjudicationRequest {
                        case_id,
                        task_type,
                        final_label: label,
                        note,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.ok {
                std::process::exit(1);
            }
        }
        Commands::Pending { task_type, limit } => {
            let items = qc.pending_adjudication(task_type.as_deref(), limit).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Commands::Report { task_types, json } => {
            let report = EvaluationReporter::new(repos)
                .with_normalizer(config.normalizer())
                .with_config(config.evaluation())
                .build(&task_types)
                .await?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                print!("{}", report.render_text());
            }
        }
    }

    Ok(())
}

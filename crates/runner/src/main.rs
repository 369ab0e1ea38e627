#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use envrun_core::{Event, RunStatus};
use envrun_core::ids::{ResourceId, TenantId};
use envrun_runner::config::{Settings, SettingsArgs};
use envrun_runner::render::{ensure_json, logs_json, pending_json, pointer_json, run_json};
use envrun_runner::{
    BuildOrchestrator, EnsureOptions, EnsureOutcome, FsCatalog, FsInputResolver, OrchestratorError,
    PrepareOptions, RunContext, RunOrchestrator, StoreHandle, StreamOptions, SystemClock,
    VenvBuilder, WaitMode,
};
use futures::StreamExt as _;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "ENVRUN_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "envrun",
    version,
    about = "Build isolated environments for configuration resources and execute runs against them"
)]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reuse or (re)build the environment of a resource.
    Ensure {
        tenant: String,
        resource: String,
        #[arg(long)]
        force: bool,
        /// Print BUILDING instead of waiting for the build to be usable. The
        /// process still stays up until the started build settles.
        #[arg(long)]
        no_wait: bool,
        /// Print build events as NDJSON while building.
        #[arg(long)]
        progress: bool,
    },
    /// Queue a run and execute it.
    Run {
        tenant: String,
        resource: String,
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        validate_only: bool,
        /// Print events as NDJSON instead of the final record.
        #[arg(long)]
        stream: bool,
    },
    /// Cursor-paged run or build logs.
    Logs {
        #[arg(long, conflicts_with = "build", required_unless_present = "build")]
        run: Option<String>,
        #[arg(long)]
        build: Option<String>,
        #[arg(long, default_value_t = 0)]
        after_id: i64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    ShowRun {
        run_id: String,
    },
    ShowBuild {
        build_id: String,
    },
    /// Environment pointers of a resource, newest first.
    Builds {
        tenant: String,
        resource: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Runs of a resource, newest first.
    Runs {
        tenant: String,
        resource: String,
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Register an input for later execution; queues it when capacity allows.
    Enqueue {
        tenant: String,
        resource: String,
        input: String,
    },
    /// Execute QUEUED runs of a resource, including ones backfilled meanwhile.
    Drain {
        tenant: String,
        resource: String,
    },
}

struct App {
    builds: BuildOrchestrator,
    runs: RunOrchestrator,
}

impl App {
    fn open(settings: &Settings) -> Result<Self, OrchestratorError> {
        let store = StoreHandle::open(&settings.storage_dir)?;
        let clock = Arc::new(SystemClock);
        let builds = BuildOrchestrator::new(
            store.clone(),
            Arc::new(FsCatalog::new(&settings.resources_dir)),
            Arc::new(VenvBuilder::new()),
            clock.clone(),
            settings.build.clone(),
        );
        let runs = RunOrchestrator::new(
            store,
            builds.clone(),
            Arc::new(FsInputResolver::new(&settings.documents_dir)),
            clock,
            settings.run.clone(),
        );
        Ok(Self { builds, runs })
    }
}

fn ids(tenant: &str, resource: &str) -> Result<(TenantId, ResourceId), OrchestratorError> {
    Ok((TenantId::try_new(tenant)?, ResourceId::try_new(resource)?))
}

fn print_json(value: &Value) -> Result<(), OrchestratorError> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value).map_err(std::io::Error::other)?;
    writeln!(out)?;
    Ok(())
}

fn print_line(line: &str) -> Result<(), OrchestratorError> {
    let mut out = std::io::stdout().lock();
    out.write_all(line.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; canceling");
            child.cancel();
        }
    });
    token
}

async fn run_command(app: App, command: Command) -> Result<(), OrchestratorError> {
    match command {
        Command::Ensure {
            tenant,
            resource,
            force,
            no_wait,
            progress,
        } => {
            let (tenant, resource) = ids(&tenant, &resource)?;
            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
            let printer = progress.then(|| {
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        if let Ok(line) = event.to_ndjson() {
                            let _ = print_line(&line);
                        }
                    }
                })
            });
            let options = EnsureOptions {
                force,
                wait: if no_wait {
                    WaitMode::Interactive
                } else {
                    WaitMode::Blocking
                },
                progress: progress.then_some(tx),
            };
            let outcome = app.builds.ensure(&tenant, &resource, options).await;
            if let Ok(building @ EnsureOutcome::Building) = &outcome {
                print_json(&ensure_json(building))?;
                // The build runs on this runtime; leaving now would orphan it.
                if let Some(row) = app.builds.wait_settled(&tenant, &resource).await? {
                    tracing::info!(build_id = %row.build_id, status = %row.status, "build settled");
                }
                if let Some(printer) = printer {
                    let _ = printer.await;
                }
                return Ok(());
            }
            if let Some(printer) = printer {
                let _ = printer.await;
            }
            print_json(&ensure_json(&outcome?))
        }
        Command::Run {
            tenant,
            resource,
            input,
            validate_only,
            stream,
        } => {
            let (tenant, resource) = ids(&tenant, &resource)?;
            let (run, ctx) = app.runs.prepare(
                &tenant,
                &resource,
                PrepareOptions {
                    input_ref: input,
                    validate_only,
                },
            )?;
            let options = StreamOptions {
                cancel: cancel_on_ctrl_c(),
            };
            if stream {
                let mut events = app.runs.stream(ctx, options);
                while let Some(item) = events.next().await {
                    let event = item?;
                    print_line(&event.to_ndjson().map_err(std::io::Error::other)?)?;
                }
                Ok(())
            } else {
                print_json(&run_json(&run))?;
                let finished = app.runs.run_to_completion(ctx, options).await?;
                print_json(&run_json(&finished))
            }
        }
        Command::Logs {
            run,
            build,
            after_id,
            limit,
        } => {
            let page = match (run, build) {
                (Some(run_id), _) => app.runs.list_run_logs(&run_id, after_id, limit)?,
                (None, Some(build_id)) => app.builds.list_build_logs(&build_id, after_id, limit)?,
                (None, None) => {
                    return Err(OrchestratorError::ValidationFailed(
                        "one of --run or --build is required".to_string(),
                    ));
                }
            };
            print_json(&logs_json(&page))
        }
        Command::ShowRun { run_id } => print_json(&run_json(&app.runs.get_run(&run_id)?)),
        Command::ShowBuild { build_id } => {
            print_json(&pointer_json(&app.builds.get_build(&build_id)?))
        }
        Command::Builds {
            tenant,
            resource,
            limit,
        } => {
            let (tenant, resource) = ids(&tenant, &resource)?;
            let rows = app.builds.list_builds(&tenant, &resource, limit)?;
            print_json(&Value::Array(rows.iter().map(pointer_json).collect()))
        }
        Command::Runs {
            tenant,
            resource,
            status,
            limit,
        } => {
            let (tenant, resource) = ids(&tenant, &resource)?;
            let rows = app.runs.list_runs(&tenant, &resource, status, limit)?;
            print_json(&Value::Array(rows.iter().map(run_json).collect()))
        }
        Command::Enqueue {
            tenant,
            resource,
            input,
        } => {
            let (tenant, resource) = ids(&tenant, &resource)?;
            let (pending, queued) = app.runs.enqueue_input(&tenant, &resource, &input)?;
            print_json(&json!({
                "pending": pending_json(&pending),
                "queued": queued.iter().map(run_json).collect::<Vec<_>>(),
            }))
        }
        Command::Drain { tenant, resource } => {
            let (tenant, resource) = ids(&tenant, &resource)?;
            drain(app, tenant, resource).await
        }
    }
}

async fn drain(app: App, tenant: TenantId, resource: ResourceId) -> Result<(), OrchestratorError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<RunContext>();
    let runs = app.runs.with_dispatch(tx);

    let mut queue = VecDeque::new();
    let mut queued = runs.list_runs(&tenant, &resource, Some(RunStatus::Queued), 200)?;
    queued.reverse();
    for row in &queued {
        queue.push_back(RunContext::from_row(row)?);
    }

    let cancel = cancel_on_ctrl_c();
    let mut finished = Vec::new();
    while let Some(ctx) = queue.pop_front() {
        if cancel.is_cancelled() {
            break;
        }
        let options = StreamOptions {
            cancel: cancel.clone(),
        };
        let row = runs.run_to_completion(ctx, options).await?;
        tracing::info!(run_id = %row.id, status = %row.status, "drained run");
        finished.push(run_json(&row));
        while let Ok(next) = rx.try_recv() {
            queue.push_back(next);
        }
    }
    print_json(&Value::Array(finished))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), OrchestratorError> {
    let cwd = std::env::current_dir()?;
    let settings = cli.settings.resolve(&cwd)?;
    let app = App::open(&settings)?;
    run_command(app, cli.command).await
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

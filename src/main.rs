use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use grid_lite::autoscaler::ManualAutoScaler;
use grid_lite::client::GridJobEvent;
use grid_lite::config::{GridConfig, NodeAgentConfig};
use grid_lite::db::MemoryJobDatabase;
use grid_lite::scheduler::job::TaskResultItem;
use grid_lite::scheduler::{JobSubmission, TaskItem};
use grid_lite::shutdown::install_shutdown_handler;
use grid_lite::user::UserProfile;
use grid_lite::GridContext;

#[derive(Parser, Debug)]
#[command(name = "grid-lite")]
#[command(version)]
#[command(about = "A compute grid: priority task dispatcher with node agents")]
#[command(propagate_version = true)]
struct Args {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a dispatcher with local node agents until interrupted
    Serve(GridArgs),

    /// Run one job on a local grid and report its result
    Run {
        #[command(flatten)]
        grid: GridArgs,

        /// Job priority (larger runs first)
        #[arg(long)]
        priority: Option<i32>,

        /// Job description
        #[arg(long)]
        description: Option<String>,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        /// Task commands, one task each
        #[arg(last = true, required = true)]
        cmds: Vec<String>,
    },
}

#[derive(Parser, Debug)]
struct GridArgs {
    /// Number of local node agents
    #[arg(long, default_value = "1")]
    nodes: usize,

    /// CPUs advertised by each node (default: available cores minus reserved)
    #[arg(long)]
    cpus: Option<usize>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobRunOutput {
    job_id: String,
    status: String,
    success: bool,
    tasks: Vec<TaskResultItem>,
}

fn load_config(path: Option<&PathBuf>, grid: &GridArgs) -> Result<GridConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => GridConfig::from_file(path)?,
        None => GridConfig::default(),
    };
    if grid.cpus.is_some() {
        config.node.num_cpus = grid.cpus;
    }
    Ok(config)
}

fn start_grid(
    config: GridConfig,
    nodes: usize,
) -> Result<GridContext, Box<dyn std::error::Error>> {
    let db = Arc::new(MemoryJobDatabase::new());
    db.add_user_profile("local", UserProfile::admin());

    let shutdown = install_shutdown_handler();
    let mut grid = GridContext::start(
        config.clone(),
        db,
        Some(Arc::new(ManualAutoScaler::new())),
        shutdown,
    )?;

    let base_name = config.node.effective_name();
    for i in 0..nodes.max(1) {
        let node_config = NodeAgentConfig {
            node_name: Some(if nodes > 1 {
                format!("{}-{}", base_name, i + 1)
            } else {
                base_name.clone()
            }),
            ..config.node.clone()
        };
        grid.spawn_node(node_config);
    }
    Ok(grid)
}

async fn serve(config: GridConfig, args: GridArgs) -> Result<(), Box<dyn std::error::Error>> {
    let grid = start_grid(config, args.nodes)?;
    tracing::info!(nodes = args.nodes, "Serving; press Ctrl-C to stop");
    grid.shutdown_token().cancelled().await;
    grid.shutdown().await;
    Ok(())
}

async fn run_job(
    config: GridConfig,
    grid_args: GridArgs,
    priority: Option<i32>,
    description: Option<String>,
    output: OutputFormat,
    cmds: Vec<String>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let grid = start_grid(config, grid_args.nodes)?;
    let session = grid.login("local", "local").await?;

    let mut submission = JobSubmission::new(cmds.into_iter().map(TaskItem::new).collect());
    if let Some(priority) = priority {
        submission = submission.with_priority(priority);
    }
    if let Some(description) = description {
        submission = submission.with_description(description);
    }

    let mut job = session.run_job(submission).await?;
    let job_id = job.job_id();
    let shutdown = grid.shutdown_token();

    let progress = loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::warn!(job_id = %job_id, "Interrupted before the job finished");
                None
            }
            event = job.next_event() => event,
        };
        match event {
            Some(GridJobEvent::Submitted(id)) => {
                tracing::info!(job_id = %id, "Job submitted");
            }
            Some(GridJobEvent::StatusChanged(p)) => {
                tracing::info!(
                    job_id = %p.job_id,
                    status = %p.status,
                    finished = p.num_tasks_finished,
                    total = p.num_tasks,
                    "Job progress"
                );
            }
            Some(GridJobEvent::Done(p)) => break Some(p),
            Some(GridJobEvent::Error(e)) => {
                tracing::error!(job_id = %job_id, error = %e, "Lost track of job");
                break None;
            }
            None => break None,
        }
    };

    let info = session.get_job_info(job_id).await?;
    let tasks = session.get_job_result(job_id).await?;
    let success = progress.map_or(false, |p| p.success);

    match output {
        OutputFormat::Json => {
            let out = JobRunOutput {
                job_id: job_id.to_string(),
                status: info.status.to_string(),
                success,
                tasks,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Job:     {}", job_id);
            println!("Status:  {}", info.status);
            println!("Success: {}", success);
            println!();
            println!("{:<6} {:<10} {:<8} {:<8} COMMAND", "TASK", "STATUS", "PID", "EXIT");
            for task in &tasks {
                println!(
                    "{:<6} {:<10} {:<8} {:<8} {}",
                    task.task_id,
                    task.status.to_string(),
                    task.pid.map_or("-".to_string(), |p| p.to_string()),
                    task.ret_code.map_or("-".to_string(), |c| c.to_string()),
                    task.cmd
                );
            }
        }
    }

    grid.shutdown().await;
    Ok(success)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Serve(grid) => match load_config(args.config.as_ref(), &grid) {
            Ok(config) => serve(config, grid).await.map(|_| true),
            Err(e) => Err(e),
        },
        Commands::Run {
            grid,
            priority,
            description,
            output,
            cmds,
        } => match load_config(args.config.as_ref(), &grid) {
            Ok(config) => run_job(config, grid, priority, description, output, cmds).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

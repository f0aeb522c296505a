use anyhow::{Context, Result, anyhow};
use bucketmove::{
    CheckpointStore, FileCheckpointStore, MigrationPlan, MigrationPolicy,
    RelocationOptions, RelocationPlan,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bucketmove")]
#[command(about = "Inspect and maintain bucket relocation checkpoints")]
struct Cli {
    /// Checkpoint directory.
    #[arg(long, default_value = ".bucketmove")]
    root: PathBuf,

    /// JSON migration policy file.
    #[arg(long)]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List units with an active checkpoint.
    List,
    /// Show the checkpoint of one unit.
    Status {
        unit: String,
        #[arg(long)]
        json: bool,
    },
    /// Move a unit's checkpoint into the archive.
    Archive { unit: String },
    /// Print the stages and steps of the relocation workflow.
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let policy = load_policy(cli.policy.as_deref())?;
    let plan = RelocationPlan::build(RelocationOptions::default())
        .context("Failed to build relocation plan")?;

    match cli.command {
        Command::Plan => {
            print_plan(&plan);
            Ok(())
        }
        Command::List => {
            let store = open_store(&cli.root, &policy).await?;
            list_units(&store, &plan).await
        }
        Command::Status { unit, json } => {
            let store = open_store(&cli.root, &policy).await?;
            show_status(&store, &plan, &unit, json).await
        }
        Command::Archive { unit } => {
            let store = open_store(&cli.root, &policy).await?;
            store
                .archive(&unit)
                .await
                .with_context(|| format!("Failed to archive checkpoint for '{}'", unit))?;
            println!("Archived checkpoint for '{}'", unit);
            Ok(())
        }
    }
}

fn load_policy(path: Option<&Path>) -> Result<MigrationPolicy> {
    let policy = match path {
        Some(path) => MigrationPolicy::load_from_file(path)
            .with_context(|| format!("Failed to load policy '{}'", path.display()))?,
        None => MigrationPolicy::default(),
    };
    policy.validate().context("Invalid migration policy")?;
    Ok(policy)
}

async fn open_store(root: &Path, policy: &MigrationPolicy) -> Result<FileCheckpointStore> {
    FileCheckpointStore::open(root, policy.durability)
        .await
        .with_context(|| format!("Failed to open checkpoint store at '{}'", root.display()))
}

fn step_label(plan: &MigrationPlan, ordinal: u32) -> String {
    if ordinal == 0 {
        return "not started".to_string();
    }
    plan.stages()
        .iter()
        .flat_map(|stage| stage.steps.iter().map(move |step| (stage, step)))
        .find(|(_, step)| step.ordinal == ordinal)
        .map(|(stage, step)| format!("{}/{}", stage.name, step.name))
        .unwrap_or_else(|| format!("unknown step {}", ordinal))
}

fn print_plan(plan: &MigrationPlan) {
    for stage in plan.stages() {
        println!("{}", stage.name);
        for step in &stage.steps {
            println!("  {:>2}  {}", step.ordinal, step.name);
        }
    }
}

async fn list_units(store: &FileCheckpointStore, plan: &MigrationPlan) -> Result<()> {
    let total = plan.total_steps();
    let units = store.list_active().await?;
    if units.is_empty() {
        println!("No active checkpoints in '{}'", store.root_dir().display());
        return Ok(());
    }
    for unit in units {
        let last = store.get_last_completed(&unit).await?;
        println!("{}\t{}/{}\t{}", unit, last, total, step_label(plan, last));
    }
    Ok(())
}

async fn show_status(
    store: &FileCheckpointStore,
    plan: &MigrationPlan,
    unit: &str,
    json: bool,
) -> Result<()> {
    let record = store
        .load_record(unit)
        .await?
        .ok_or_else(|| anyhow!("No active checkpoint for '{}'", unit))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("unit:           {}", record.unit_id);
    println!(
        "last completed: {} ({})",
        record.last_completed,
        step_label(plan, record.last_completed)
    );
    println!("updated at:     {}", record.updated_at.to_rfc3339());
    if record.snapshots.is_empty() {
        println!("snapshots:      none");
    } else {
        println!("snapshots:");
        for key in record.snapshots.keys() {
            println!("  {}", key);
        }
    }
    Ok(())
}

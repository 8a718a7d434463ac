//! Relay CLI: start, continue, inspect and control workflow instances.
//!
//! Each invocation performs one unit of work against the persisted instance
//! state and prints a JSON report to stdout. Logs go to stderr.

use clap::{Args, Parser, Subcommand};

use relay_cli::commands::{self, workflow, GlobalOptions};
use relay_core::config::DEFAULT_DB_FILE;
use relay_core::StartOptions;

/// Relay: resumable multi-agent workflow engine
#[derive(Parser)]
#[command(name = "relay", version, about = "Relay: resumable multi-agent workflow engine")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, global = true, env = "RELAY_DB_PATH", default_value = DEFAULT_DB_FILE)]
    db: String,

    /// Engine configuration file (defaults to ./relay.yaml when present)
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    config: Option<String>,

    /// Shell command run for each dispatched step (request JSON on stdin)
    #[arg(long, global = true, env = "RELAY_WORKER_CMD")]
    worker_cmd: Option<String>,

    /// HTTP endpoint each dispatched step is POSTed to
    #[arg(long, global = true, env = "RELAY_WORKER_URL")]
    worker_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ContextArgs {
    /// Catalog resolution context: core, group or hybrid
    #[arg(long = "target-context", default_value = "core")]
    target_context: String,
    /// Group name for the group and hybrid contexts
    #[arg(long)]
    group: Option<String>,
    /// Treat validation warnings as errors
    #[arg(long)]
    strict: bool,
}

#[derive(Args)]
struct StartArgs {
    /// Workflow name or path to a YAML file
    #[arg(long)]
    workflow: String,
    /// Explicit instance id (generated when omitted)
    #[arg(long)]
    instance_id: Option<String>,
    #[command(flatten)]
    context: ContextArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an instance and run it up to its first action step's result
    Start(StartArgs),

    /// Start an instance and keep continuing it until it is no longer active
    Run(StartArgs),

    /// Advance an instance by one action step
    Continue {
        instance_id: String,
        /// Load the definition from here instead of the recorded source
        #[arg(long)]
        workflow: Option<String>,
    },

    /// Print the report of an instance
    Status { instance_id: String },

    /// Move past the current step without running it
    Skip {
        instance_id: String,
        /// Step to jump to (required when the current step is a routing step)
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        workflow: Option<String>,
    },

    /// Abort an instance
    Abort { instance_id: String },

    /// Validate a workflow against the catalog without running it
    Validate {
        #[arg(long)]
        workflow: String,
        #[command(flatten)]
        context: ContextArgs,
    },

    /// List instances and the workflows available to the loader
    List {
        /// Only instances of this workflow id
        #[arg(long)]
        workflow_id: Option<String>,
        /// Only instances with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// List the checkpoints recorded for an instance
    Checkpoints { instance_id: String },
}

fn start_options(args: StartArgs) -> Result<StartOptions, String> {
    Ok(StartOptions {
        workflow: args.workflow,
        context: workflow::context(&args.context.target_context, args.context.group)?,
        strict: args.context.strict,
        instance_id: args.instance_id,
    })
}

async fn dispatch(cli: Cli) -> Result<(), String> {
    let opts = GlobalOptions {
        db: cli.db,
        config: cli.config,
        worker_cmd: cli.worker_cmd,
        worker_url: cli.worker_url,
    };

    match cli.command {
        Commands::Start(args) => {
            let start = start_options(args)?;
            let engine = commands::init_engine(&opts, true)?;
            workflow::start(&engine, &start).await
        }
        Commands::Run(args) => {
            let start = start_options(args)?;
            let engine = commands::init_engine(&opts, true)?;
            workflow::run(&engine, &start).await
        }
        Commands::Continue { instance_id, workflow: source } => {
            let engine = commands::init_engine(&opts, true)?;
            workflow::continue_instance(&engine, &instance_id, source.as_deref()).await
        }
        Commands::Status { instance_id } => {
            let engine = commands::init_engine(&opts, false)?;
            workflow::status(&engine, &instance_id).await
        }
        Commands::Skip {
            instance_id,
            target,
            workflow: source,
        } => {
            let engine = commands::init_engine(&opts, false)?;
            workflow::skip(&engine, &instance_id, target.as_deref(), source.as_deref()).await
        }
        Commands::Abort { instance_id } => {
            let engine = commands::init_engine(&opts, false)?;
            workflow::abort(&engine, &instance_id).await
        }
        Commands::Validate {
            workflow: source,
            context,
        } => {
            let ctx = workflow::context(&context.target_context, context.group)?;
            let engine = commands::init_engine(&opts, false)?;
            workflow::validate(&engine, &source, ctx, context.strict)
        }
        Commands::List { workflow_id, status } => {
            let engine = commands::init_engine(&opts, false)?;
            workflow::list(&engine, workflow_id.as_deref(), status.as_deref()).await
        }
        Commands::Checkpoints { instance_id } => {
            let engine = commands::init_engine(&opts, false)?;
            workflow::checkpoints(&engine, &instance_id).await
        }
    }
}

#[tokio::main]
async fn main() {
    // Before parsing, so .env values can feed clap's `env` fallbacks
    let env_files = commands::load_dotenv();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_core=info,relay_cli=info".into()),
        )
        .init();
    for path in &env_files {
        tracing::debug!("[relay] Loaded environment from '{}'", path.display());
    }

    if let Err(e) = dispatch(cli).await {
        println!("{}", e);
        std::process::exit(1);
    }
}

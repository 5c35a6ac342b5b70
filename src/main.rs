use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gearwork::{demo, shutdown_on_signal, Config, FunctionRegistry, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "gearwork-worker")]
#[command(about = "Serve gearwork functions against a gearman queue")]
struct Args {
    /// Function to serve, or "all" for every registered function
    function: String,

    /// Worker instances to spawn per function
    #[arg(long, default_value_t = 1)]
    instances: usize,

    /// Gearman server as host[:port]; repeat for multiple servers
    #[arg(long = "server")]
    servers: Vec<String>,

    /// Base directory for per-job logs
    #[arg(long)]
    worker_log_dir: Option<PathBuf>,

    /// Failure notification recipient; repeat for multiple addresses.
    /// Notifications are disabled when none is given.
    #[arg(long = "notif-email")]
    notif_emails: Vec<String>,

    /// Sender address for failure notifications
    #[arg(long = "notif-from")]
    notif_from: Option<String>,

    /// Prefix prepended to notification subjects
    #[arg(long = "notif-subj-prefix")]
    notif_subj_prefix: Option<String>,
}

fn build_config(args: &Args) -> Config {
    let mut config = Config::default();
    if !args.servers.is_empty() {
        config.gearman_servers = args.servers.clone();
    }
    if let Some(dir) = &args.worker_log_dir {
        config.worker_log_dir = dir.clone();
    }
    config.notifications_emails = args.notif_emails.clone();
    if let Some(from) = &args.notif_from {
        config.notifications_from_address = from.clone();
    }
    if let Some(prefix) = &args.notif_subj_prefix {
        config.notifications_subject_prefix = prefix.clone();
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args);

    let mut registry = FunctionRegistry::new();
    demo::register_all(&mut registry);

    let mut options = WorkerPool::options()
        .config(config)
        .registry(registry)
        .instances(args.instances)
        .shutdown(shutdown_on_signal());
    if args.function != "all" {
        options = options.function(&args.function);
    }

    let pool = options.init()?;
    tracing::info!(
        function = %args.function,
        instances = args.instances,
        workers = pool.worker_count(),
        "Starting gearwork worker pool"
    );

    pool.run().await?;
    Ok(())
}

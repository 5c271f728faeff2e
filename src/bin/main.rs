use anyhow::Result;
use clap::{Parser, Subcommand};
use coresmith::orchestrate::{self, RunOptions};
use coresmith::source;
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[clap(long, global = true, default_value_t = Level::INFO)]
    level: tracing::Level,

    /// Root directory for cores, cache, and output (default: ~/.coresmith)
    #[clap(long, global = true)]
    root: Option<PathBuf>,

    /// Directory holding profiles.toml, recipes.toml, and patches/
    #[clap(default_value = "config", long, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch core sources for a CPU target without building
    Fetch {
        /// CPU family to target, as named in profiles.toml
        #[clap(long, short)]
        family: String,

        /// Only these cores (comma separated; default: all recipes)
        #[clap(long, value_delimiter = ',')]
        cores: Vec<String>,

        /// Concurrent fetch workers
        #[clap(default_value_t = source::DEFAULT_WORKERS, long)]
        workers: usize,
    },

    /// Fetch and build cores for a CPU target
    Build {
        /// CPU family to target, as named in profiles.toml
        #[clap(long, short)]
        family: String,

        /// Only these cores (comma separated; default: all recipes)
        #[clap(long, value_delimiter = ',')]
        cores: Vec<String>,

        /// Parallel jobs passed to the build tool (default: all cpus)
        #[clap(long, short)]
        jobs: Option<usize>,

        /// Concurrent fetch workers
        #[clap(default_value_t = source::DEFAULT_WORKERS, long)]
        fetch_workers: usize,

        /// Run the clean target before each make build
        #[clap(long)]
        clean: bool,

        /// Per-core wall-clock timeout for build subprocesses, in seconds
        #[clap(long)]
        timeout_secs: Option<u64>,

        /// Build already-fetched sources without touching the network
        #[clap(long)]
        skip_fetch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut subscriber = tracing_subscriber::FmtSubscriber::builder().with_max_level(cli.level);

    // when we run the command with `TRACE` or `DEBUG` level, we want to see
    // the file and line number...
    if [Level::DEBUG, Level::TRACE].contains(&cli.level) {
        subscriber = subscriber.with_file(true).with_line_number(true);
    }
    let subscriber = subscriber.finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber");

    match cli.command {
        Command::Fetch {
            family,
            cores,
            workers,
        } => {
            orchestrate::run(RunOptions {
                family,
                root: cli.root,
                config_dir: cli.config,
                cores,
                jobs: 1,
                fetch_workers: workers,
                clean: false,
                timeout_secs: None,
                fetch: true,
                build: false,
            })
            .await
        }

        Command::Build {
            family,
            cores,
            jobs,
            fetch_workers,
            clean,
            timeout_secs,
            skip_fetch,
        } => {
            orchestrate::run(RunOptions {
                family,
                root: cli.root,
                config_dir: cli.config,
                cores,
                jobs: jobs.unwrap_or_else(default_jobs),
                fetch_workers,
                clean,
                timeout_secs,
                fetch: !skip_fetch,
                build: true,
            })
            .await
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(1)
}

//! Command line interface for jobherd
//!
//! - `start`, `shutdown`, `restart`, `status`: daemon control
//! - `work`: a single worker in the foreground
//! - `scheduler`: the delayed-job promoter
//! - `ping`, `submit`: job submission
//! - `completions`: shell completions

pub mod completions;
pub mod daemon;
pub mod jobs;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use jobherd::infrastructure::{Config, init_logging};
use jobherd_core::Priority;

/// A job-worker daemon: supervised worker processes and a delayed-job scheduler
#[derive(Parser, Debug)]
#[command(name = "jobherd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Environment name selecting jobherd.<ENV>.yaml
    #[arg(long, global = true)]
    pub env: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the worker daemon
    #[command(name = "start")]
    Start(StartArgs),

    /// Gracefully stop the running daemon
    #[command(name = "shutdown")]
    Shutdown(PidArgs),

    /// Rolling restart of the running daemon's workers
    #[command(name = "restart")]
    Restart(PidArgs),

    /// Show daemon and queue state
    #[command(name = "status")]
    Status(StatusArgs),

    /// Check that a worker answers
    #[command(name = "ping")]
    Ping(PingArgs),

    /// Promote delayed jobs once they are due
    #[command(name = "scheduler")]
    Scheduler(SchedulerArgs),

    /// Run one worker in the foreground
    #[command(name = "work")]
    Work(WorkArgs),

    /// Submit a job
    #[command(name = "submit")]
    Submit(SubmitArgs),

    /// Generate shell completions
    #[command(name = "completions")]
    Completions(CompletionsArgs),
}

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Configuration name (defaults to the default connection)
    #[arg(value_name = "CONFIG")]
    pub config_name: Option<String>,

    /// Workers block on the broker while idle
    #[arg(long)]
    pub blocking: bool,

    /// Detach and run in the background
    #[arg(long)]
    pub daemon: bool,

    /// Number of workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Total number of worker spawns allowed, 0 for unlimited
    #[arg(short, long)]
    pub limit: Option<u64>,

    /// Replace workers that exit
    #[arg(long)]
    pub resuscitate: bool,

    /// One job per worker process; implies --resuscitate and, unless given, --limit 0
    #[arg(long)]
    pub atomic: bool,

    /// PID file location
    #[arg(long, value_name = "PATH")]
    pub pid: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct PidArgs {
    /// PID file location
    #[arg(long, value_name = "PATH")]
    pub pid: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Configuration name whose queues are reported
    #[arg(value_name = "CONFIG")]
    pub config_name: Option<String>,

    /// PID file location
    #[arg(long, value_name = "PATH")]
    pub pid: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct PingArgs {
    /// Configuration name
    #[arg(value_name = "CONFIG")]
    pub config_name: Option<String>,

    /// Schedule the ping this many seconds ahead
    #[arg(default_value_t = 0)]
    pub delay: u64,

    /// Seconds to wait for the answer once the job is due
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SchedulerArgs {
    /// Seconds between polls when nothing is due
    #[arg(default_value_t = 1)]
    pub interval: u64,

    /// Configuration name
    #[arg(value_name = "CONFIG")]
    pub config_name: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct WorkArgs {
    /// Configuration name
    #[arg(value_name = "CONFIG")]
    pub config_name: Option<String>,

    /// Block on the broker while idle
    #[arg(long)]
    pub blocking: bool,

    /// Exit after one job
    #[arg(long)]
    pub atomic: bool,

    /// Started by the daemon; report startup failures to it
    #[arg(long, hide = true)]
    pub supervised: bool,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Task to run
    pub task: String,

    /// Task arguments, parsed as JSON where possible
    pub args: Vec<String>,

    /// Configuration name
    #[arg(long)]
    pub config_name: Option<String>,

    /// Do not wait for the result
    #[arg(long)]
    pub background: bool,

    /// low, normal or high
    #[arg(long, default_value = "normal")]
    pub priority: Priority,

    /// Run this many seconds from now
    #[arg(long)]
    pub delay: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell type
    #[arg(value_enum)]
    pub shell: Shell,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Build the CLI command for completion generation
#[must_use]
pub fn build_cli() -> clap::Command {
    Cli::command()
}

/// Parse and execute CLI arguments, returning the process exit code
pub async fn run() -> Result<i32> {
    let cli = Cli::parse();

    if let Commands::Completions(args) = &cli.command {
        completions::write_completions(args.shell, args.output.as_deref())?;
        return Ok(0);
    }

    let config = Config::load(cli.config.as_deref(), cli.env.as_deref())
        .context("Failed to load configuration")?;
    init_logging(&config.log, cli.verbose).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Start(args) => daemon::start(&config, cli.verbose, args).await,
        Commands::Shutdown(args) => daemon::shutdown(&config, &args),
        Commands::Restart(args) => daemon::restart(&config, &args),
        Commands::Status(args) => daemon::status(&config, args).await,
        Commands::Ping(args) => jobs::ping(&config, args).await,
        Commands::Scheduler(args) => jobs::scheduler(&config, args).await,
        Commands::Work(args) => jobs::work(&config, args).await,
        Commands::Submit(args) => jobs::submit(&config, args).await,
        Commands::Completions(_) => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_start_parse() {
        let args = Cli::parse_from([
            "jobherd", "--config", "jobherd.yaml", "start", "reports", "--workers", "3", "--atomic",
            "--daemon",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("jobherd.yaml")));
        match args.command {
            Commands::Start(start) => {
                assert_eq!(start.config_name.as_deref(), Some("reports"));
                assert_eq!(start.workers, Some(3));
                assert!(start.atomic);
                assert!(start.daemon);
                assert_eq!(start.limit, None);
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_global_flags_after_command() {
        let args = Cli::parse_from(["jobherd", "shutdown", "--pid", "/run/j.pid", "--verbose"]);
        assert!(args.verbose);
        match args.command {
            Commands::Shutdown(pid) => assert_eq!(pid.pid, Some(PathBuf::from("/run/j.pid"))),
            _ => panic!("Expected Shutdown command"),
        }
    }

    #[test]
    fn test_cli_ping_parse() {
        let args = Cli::parse_from(["jobherd", "ping", "default", "5", "--timeout", "2"]);
        match args.command {
            Commands::Ping(ping) => {
                assert_eq!(ping.config_name.as_deref(), Some("default"));
                assert_eq!(ping.delay, 5);
                assert_eq!(ping.timeout, Some(2));
            }
            _ => panic!("Expected Ping command"),
        }
    }

    #[test]
    fn test_cli_scheduler_defaults() {
        let args = Cli::parse_from(["jobherd", "scheduler"]);
        match args.command {
            Commands::Scheduler(scheduler) => {
                assert_eq!(scheduler.interval, 1);
                assert_eq!(scheduler.config_name, None);
            }
            _ => panic!("Expected Scheduler command"),
        }
    }

    #[test]
    fn test_cli_work_parse() {
        let args = Cli::parse_from(["jobherd", "work", "default", "--supervised", "--blocking"]);
        match args.command {
            Commands::Work(work) => {
                assert!(work.supervised);
                assert!(work.blocking);
                assert!(!work.atomic);
            }
            _ => panic!("Expected Work command"),
        }
    }

    #[test]
    fn test_cli_submit_parse() {
        let args = Cli::parse_from([
            "jobherd", "submit", "echo", "1", "two", "--priority", "high", "--background",
        ]);
        match args.command {
            Commands::Submit(submit) => {
                assert_eq!(submit.task, "echo");
                assert_eq!(submit.args, vec!["1", "two"]);
                assert_eq!(submit.priority, Priority::High);
                assert!(submit.background);
            }
            _ => panic!("Expected Submit command"),
        }
    }

    #[test]
    fn test_cli_completions_parse() {
        let args = Cli::parse_from(["jobherd", "completions", "bash"]);
        match args.command {
            Commands::Completions(c) => assert_eq!(c.shell, Shell::Bash),
            _ => panic!("Expected Completions command"),
        }
    }
}

//! `jobherd start|shutdown|restart|status` - Daemon control

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::Instrument;

use jobherd::infrastructure::{Config, process_span};
use jobherd_core::{Broker, DelayedStore};
use jobherd_worker::{CommandSpawner, PidFile, StartOptions, SupervisorConfig};

use super::jobs::open_backend;
use super::{PidArgs, StartArgs, StatusArgs};

/// Runs the daemon, or detaches it with `--daemon`
pub async fn start(config: &Config, verbose: bool, args: StartArgs) -> Result<i32> {
    let config_name = config.config_name(args.config_name.clone());
    config.connection(&config_name)?;
    let supervisor = supervisor_config(config, &args);
    let pid_file = pid_file(config, args.pid.as_ref());

    if args.daemon {
        let child_args = std::env::args_os().skip(1).filter(|arg| arg != "--daemon");
        let pid = jobherd_worker::detach(&pid_file, child_args)?;
        println!("jobherd daemon started with pid {pid}");
        return Ok(0);
    }

    let spawner = CommandSpawner::current_exe(worker_args(config, verbose, &config_name, &supervisor))
        .context("Cannot locate the jobherd executable")?;
    let options = StartOptions {
        pid_file,
        supervisor,
    };
    let exit_code = jobherd_worker::start(options, spawner)
        .instrument(process_span("daemon"))
        .await?;
    Ok(exit_code)
}

/// Sends the graceful-stop signal to the running daemon
pub fn shutdown(config: &Config, args: &PidArgs) -> Result<i32> {
    let pid = jobherd_worker::shutdown(&pid_file(config, args.pid.as_ref()))?;
    println!("Shutdown requested for daemon {pid}");
    Ok(0)
}

/// Sends the reload signal to the running daemon
pub fn restart(config: &Config, args: &PidArgs) -> Result<i32> {
    let pid = jobherd_worker::restart(&pid_file(config, args.pid.as_ref()))?;
    println!("Restart requested for daemon {pid}");
    Ok(0)
}

/// Prints the daemon state and the queue counters of one configuration
pub async fn status(config: &Config, args: StatusArgs) -> Result<i32> {
    let daemon = jobherd_worker::status(&pid_file(config, args.pid.as_ref()))?;
    let config_name = config.config_name(args.config_name);
    let function = config.function(&config_name);
    let backend = open_backend(config, &config_name).await?;

    println!("daemon:             {daemon}");
    println!("function:           {function}");
    println!("registered workers: {}", backend.registered_workers(&function).await?);
    println!("queued jobs:        {}", backend.queued(&function).await?);
    println!("delayed jobs:       {}", backend.pending().await?);
    println!("set aside:          {}", backend.failed_delayed().await?);
    if let Some(next_due) = backend.next_due().await? {
        println!("next due:           {next_due}");
    }
    Ok(0)
}

fn pid_file(config: &Config, flag: Option<&PathBuf>) -> PidFile {
    PidFile::new(flag.cloned().unwrap_or_else(|| config.pid_file.clone()))
}

/// Configured pool settings with command line overrides applied
fn supervisor_config(config: &Config, args: &StartArgs) -> SupervisorConfig {
    let mut supervisor = config.supervisor();
    if let Some(workers) = args.workers {
        supervisor.workers = workers;
    }
    supervisor.blocking |= args.blocking;
    supervisor.resuscitate |= args.resuscitate;
    if args.atomic {
        supervisor.atomic = true;
        supervisor.limit = 0;
    }
    if let Some(limit) = args.limit {
        supervisor.limit = limit;
    }
    supervisor.effective()
}

/// Arguments a supervised worker is started with
fn worker_args(
    config: &Config,
    verbose: bool,
    config_name: &str,
    supervisor: &SupervisorConfig,
) -> Vec<OsString> {
    let mut args = Vec::new();
    if let Some(source) = &config.source {
        args.push(OsString::from("--config"));
        args.push(source.clone().into_os_string());
    }
    if verbose {
        args.push("--verbose".into());
    }
    args.extend(["work".into(), config_name.into(), "--supervised".into()]);
    if supervisor.blocking {
        args.push("--blocking".into());
    }
    if supervisor.atomic {
        args.push("--atomic".into());
    }
    args
}

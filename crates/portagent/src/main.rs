use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, atomic::AtomicUsize},
};

use clap::Parser;
use portagent::{
    AgentError,
    agent::PortAgent,
    config::PortAgentConfig,
};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag as signal_flag,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Mediates between one instrument and its drivers: frames instrument bytes
/// into timestamped packets, fans them out to driver sockets and a log, and
/// carries commands back.
#[derive(Parser, Debug)]
#[command(name = "portagent", version)]
struct Cli {
    /// Observatory config/command port to listen on
    #[arg(short = 'p')]
    port: u16,

    /// Configuration file (one config command per line)
    #[arg(short = 'c')]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v')]
    verbose: bool,

    /// Kill a running instance via its pid file and exit
    #[arg(short = 'k')]
    kill: bool,

    /// Single shot: stay in the foreground, do not daemonize
    #[arg(short = 's')]
    single_shot: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "exiting");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), AgentError> {
    let mut cfg = match &cli.config {
        Some(path) => PortAgentConfig::load(path)?,
        None => PortAgentConfig::default(),
    };
    cfg.config_port = cli.port;

    let pid_path = cfg.pid_path();
    if cli.kill {
        return kill_running(&pid_path);
    }
    if let Some(pid) = read_pid(&pid_path)
        && process_alive(pid)
    {
        return Err(AgentError::AlreadyRunning(pid));
    }

    cfg.validate()?;
    if !cli.single_shot {
        daemonize()?;
    }
    fs::create_dir_all(&cfg.log_dir)?;
    fs::write(&pid_path, format!("{}\n", std::process::id()))?;

    let shutdown = Arc::new(AtomicUsize::new(0));
    signal_flag::register_usize(SIGTERM, Arc::clone(&shutdown), SIGTERM as usize)?;
    signal_flag::register_usize(SIGINT, Arc::clone(&shutdown), SIGINT as usize)?;

    let cfg_path = cli.config.clone();
    let result = PortAgent::new(cfg, cfg_path, shutdown).and_then(|mut agent| agent.run());

    if let Err(err) = fs::remove_file(&pid_path) {
        warn!(%err, "couldn't remove pid file");
    }
    result
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn kill_running(pid_path: &Path) -> Result<(), AgentError> {
    let Some(pid) = read_pid(pid_path) else {
        return Err(AgentError::Config(format!("no pid file at {}", pid_path.display())));
    };
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
        return Err(AgentError::Io(std::io::Error::last_os_error()));
    }
    info!(pid, "sent SIGTERM");
    Ok(())
}

/// Classic fork-and-setsid; the parent exits immediately.
fn daemonize() -> Result<(), AgentError> {
    match unsafe { libc::fork() } {
        -1 => return Err(AgentError::Io(std::io::Error::last_os_error())),
        0 => {}
        _parent => std::process::exit(0),
    }
    if unsafe { libc::setsid() } == -1 {
        return Err(AgentError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

//! Scryer - debugger automation and code indexing
//!
//! Entry point that handles CLI argument parsing and switches between the
//! executor (`serve`) and the controller REPL (`repl`).

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use scryer::config::EngineConfig;

/// Scryer: debugger automation and code indexing for live processes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Directory holding the process-keyed status and index blobs
    #[arg(long, global = true)]
    ipc_dir: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Attach to a process and serve requests for it
    Serve {
        #[arg(long)]
        pid: u32,
        /// Unix socket to listen on
        #[arg(long)]
        socket: PathBuf,
    },
    /// Open the controller REPL for a served process
    Repl {
        #[arg(long)]
        pid: u32,
        /// Unix socket the executor listens on
        #[arg(long)]
        socket: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    let mut config = EngineConfig::from_env();
    if let Some(dir) = args.ipc_dir {
        config.ipc_dir = dir;
    }
    log::debug!("Configuration: {:?}", config);

    // 3. Branch based on execution mode
    match args.mode {
        Mode::Serve { pid, socket } => serve(pid, socket, config),
        Mode::Repl { pid, socket } => repl(pid, socket, config),
    }
}

#[cfg(unix)]
fn repl(pid: u32, socket: PathBuf, config: EngineConfig) -> anyhow::Result<()> {
    use std::sync::Arc;

    use scryer::controller::Controller;
    use scryer::ipc::transport::SocketTransport;
    use scryer::ui::cli::run_cli;

    println!("[*] Scryer v{} - controller for process {}", env!("CARGO_PKG_VERSION"), pid);
    let transport = SocketTransport::connect(&socket)
        .with_context(|| format!("connecting to {}", socket.display()))?;
    let controller = Arc::new(Controller::new(Box::new(transport), pid, config));
    run_cli(controller)
}

#[cfg(not(unix))]
fn repl(_pid: u32, _socket: PathBuf, _config: EngineConfig) -> anyhow::Result<()> {
    anyhow::bail!("the controller REPL requires Unix sockets")
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn serve(pid: u32, socket: PathBuf, config: EngineConfig) -> anyhow::Result<()> {
    use scryer::core::PtraceDebugger;
    use scryer::executor::Executor;
    use scryer::ipc::transport::SocketEndpoint;

    let debugger = PtraceDebugger::attach(pid).with_context(|| format!("attaching to {}", pid))?;
    let mut endpoint = SocketEndpoint::bind(&socket)
        .with_context(|| format!("listening on {}", socket.display()))?;
    println!("[*] Scryer v{} - serving process {} on {}", env!("CARGO_PKG_VERSION"), pid, socket.display());

    let mut executor = Executor::new(debugger, config);
    executor.serve(&mut endpoint)?;
    log::info!("Executor for process {} finished", pid);
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn serve(_pid: u32, _socket: PathBuf, _config: EngineConfig) -> anyhow::Result<()> {
    anyhow::bail!("serving requires Linux on x86-64")
}

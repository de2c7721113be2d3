use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use fcgi_scripthost::config::{parse_mode, Address};
use fcgi_scripthost::{Config, ProcessEngine, Server};


/// A FastCGI application server running every request's script as a
/// CGI/1.1 child process.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Where to listen, as `unix:<path>` or `tcp:<host>:<port>`
    #[arg(short, long, env = "SCRIPTHOST_ADDRESS", default_value = Config::DEFAULT_ADDRESS)]
    address: Address,
    /// Maximum number of simultaneously served connections
    #[arg(long, env = "SCRIPTHOST_MAX_CONNS", default_value = "4")]
    max_conns: NonZeroUsize,
    /// Maximum number of active requests per connection
    #[arg(long, env = "SCRIPTHOST_MAX_REQS", default_value = "4")]
    max_reqs: NonZeroUsize,
    /// Octal permissions of a Unix socket
    #[arg(long, env = "SCRIPTHOST_SOCKET_MODE", default_value = "660", value_parser = parse_mode)]
    socket_mode: u32,
    /// Run scripts through this interpreter instead of executing them directly
    #[arg(short, long, env = "SCRIPTHOST_INTERPRETER")]
    interpreter: Option<PathBuf>,
}

impl Args {
    fn split(self) -> (Config, ProcessEngine) {
        let config = Config {
            address: self.address,
            max_conns: self.max_conns,
            max_reqs: self.max_reqs,
            socket_mode: self.socket_mode,
        };
        let engine = self.interpreter.map_or_else(ProcessEngine::new, ProcessEngine::with_interpreter);
        (config, engine)
    }
}


#[tokio::main]
async fn main() -> ExitCode {
    let (config, engine) = Args::parse().split();
    init_tracing();
    tracing::debug!(?config, ?engine, "configuration loaded");

    let server = Server::new(config, engine);
    let listener = match server.bind().await {
        Ok(l) => l,
        Err(e) => {
            let error: &dyn std::error::Error = &e;
            tracing::error!(error, address = %server.config().address, "binding listener failed");
            return ExitCode::FAILURE;
        },
    };

    // Serve FastCGI connections until we receive a quit signal
    let res = tokio::select! {
        biased;  // poll in order, so quit() future first
        r = quit() => r,
        () = server.serve(&listener) => Ok(()),
    };
    if let Err(e) = res {
        let error: &dyn std::error::Error = &e;
        tracing::error!(error, "waiting for quit signal failed");
    }

    // Let active connections finish their current message before exiting
    server.shutdown().await;
    drop(listener);
    ExitCode::SUCCESS
}


/// Waits for a signal to shut the FastCGI server down.
#[cfg(not(unix))]
fn quit() -> impl std::future::Future<Output = io::Result<()>> {
    tokio::signal::ctrl_c()
}

/// Waits for a signal to shut the FastCGI server down.
#[cfg(unix)]
async fn quit() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}


/// Sets up a `tracing` subscriber writing to stderr. Its verbosity level is
/// configured with the `RUST_LOG` environment variable.
fn init_tracing() {
    use tracing_subscriber::{filter::LevelFilter, fmt};
    let max_level = match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => var.parse::<LevelFilter>().unwrap_or_else(|e| {
            eprintln!("Ignoring `RUST_LOG={var}`: {e}");
            LevelFilter::INFO
        }),
        Ok(_) | Err(std::env::VarError::NotPresent) => LevelFilter::INFO,
        Err(e) => {
            eprintln!("Ignoring `RUST_LOG`: {e}");
            LevelFilter::INFO
        },
    };

    fmt::fmt()
        .with_timer(fmt::time::uptime())
        .with_max_level(max_level)
        .with_writer(io::stderr)
        .init();
}

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{signal, SigHandler, Signal};
use server::{Config, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(about = "epoll-driven static HTTP/1.1 server")]
struct Cli {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u32,

    /// 0 = all level-triggered, 1 = connections edge, 2 = listener edge, 3 = all edge
    #[arg(short, long, default_value_t = 3)]
    trig_mode: u8,

    /// Idle timeout per connection in milliseconds; 0 disables expiry
    #[arg(long, default_value_t = 60000)]
    timeout_ms: i64,

    /// SO_LINGER on the listener for a graceful close
    #[arg(long)]
    linger: bool,

    /// Worker threads handling socket I/O and parsing
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Directory the static documents are served from
    #[arg(long, default_value = "./resources")]
    root: PathBuf,

    /// trace | debug | info | warn | error
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_level(&cli.log)?)
        .init();

    // a reset peer must surface as a write error, not kill the process
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignore SIGPIPE")?;
    raise_nofile_limit();

    let cfg = Config::new(cli.port, cli.trig_mode, cli.timeout_ms, cli.linger, cli.workers)?;
    let root = Arc::new(cli.root);
    let conn_et = cfg.trig_mode.conn_et();

    let server = Server::bind(cfg, move |stream, addr| {
        proto::HttpSession::new(stream, addr, conn_et, Arc::clone(&root))
    })?;
    server.run()
}

fn log_level(name: &str) -> Result<LevelFilter> {
    Ok(match name {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        other => bail!("unknown log level {other:?}"),
    })
}

fn raise_nofile_limit() {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) if soft < hard => match setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
            Ok(()) => info!(limit = hard, "raised open-file limit"),
            Err(err) => warn!(%err, "could not raise open-file limit"),
        },
        Ok(_) => {}
        Err(err) => warn!(%err, "could not read open-file limit"),
    }
}

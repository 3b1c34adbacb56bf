//! sinkhole-dns - an allow-list DNS resolver that answers everything else with a sinkhole address

pub mod codec;
pub mod config;
pub mod dns_server;
pub mod plugin;
pub mod policy;
pub mod supervisor;
pub mod types;

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use chrono::Local;
use rolling_file::{RollingConditionBasic, RollingFileAppender};

// Log timestamps in local time instead of the subscriber's UTC default.
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "sinkhole-dns")]
#[command(about = "Allow-list DNS resolver: listed domains resolve, everything else hits the sinkhole", long_about = None)]
struct Args {
    /// Corefile to load; the built-in allow-list is used when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address; its port applies to server blocks without one
    #[arg(long, default_value = "0.0.0.0:53")]
    address: SocketAddr,

    #[arg(long, default_value = "logs")]
    log_dir: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("sinkhole-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, cores))
}

async fn async_main(args: Args, cores: usize) -> Result<()> {
    std::fs::create_dir_all(&args.log_dir)?;

    let file_appender = RollingFileAppender::new(
        format!("{}/sinkhole-dns.log", args.log_dir),
        RollingConditionBasic::new().daily(),
        30,
    )?;

    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    info!("Starting sinkhole-dns version {}", env!("CARGO_PKG_VERSION"));
    info!("Serving with {} worker threads", cores);

    let config_path = match &args.config {
        Some(path) => {
            let abs = std::fs::canonicalize(path)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| path.clone());
            info!("Using configuration {}", abs);
            Some(abs)
        }
        None => {
            info!("No configuration given, using the built-in allow-list");
            None
        }
    };

    // Every reload builds a fresh, immutable policy table and swaps the whole
    // generation. Only the first load is allowed to fail the process.
    let supervisor = supervisor::Supervisor::start(config_path, args.address).await?;
    supervisor.run().await
}

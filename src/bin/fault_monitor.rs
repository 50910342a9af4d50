//! fault_monitor - record every camera's last seconds whenever the
//! controller raises its fault tag.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fault_video::{logging, recorder, RecorderConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "FAULT_VIDEO_CONFIG")]
    config: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `fault_video=trace`. RUST_LOG takes precedence.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    if let Err(e) = run() {
        // Errors before the logger is installed only reach stderr.
        if log::max_level() == log::LevelFilter::Off {
            eprintln!("fault_monitor: {:#}", e);
        } else {
            log::error!("{:#}", e);
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = RecorderConfig::load(args.config.as_deref())?;
    let log_path = logging::init(&config.log, &config.output.root, args.log_level.as_deref())?;

    log::info!("fault_monitor {} starting", env!("CARGO_PKG_VERSION"));
    log::debug!("logging to {}", log_path.display());
    config.log_summary();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");
    println!("Press Ctrl-C to exit");

    recorder::run(&config, shutdown)
}

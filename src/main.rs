extern crate chrono;
extern crate clap;
extern crate ctrlc;
#[macro_use]
extern crate lazy_static;
extern crate nix;
extern crate parking_lot;
#[macro_use]
extern crate quick_error;
extern crate rand;
extern crate regex;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate toml;
#[macro_use]
extern crate tracing;
extern crate tracing_subscriber;

mod config;
mod control;
mod core;
mod logger;
mod modules;
mod plugins;
mod sources;

use crate::config::BotConfig;
use crate::core::BotCore;
use crate::sources::IrcSessionFactory;
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often the main thread looks for servers which gave up
const REAP_INTERVAL: Duration = Duration::from_millis(500);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "chatbotd")]
#[command(about = "Chat bot daemon with plugins and a local control socket")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "chatbotd.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// SIGINT, and SIGTERM through the `termination` feature, ask for shutdown.
fn install_shutdown_handler() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(|| SHUTDOWN.store(true, Ordering::SeqCst))
}

fn main() {
    let cli = Cli::parse();
    let config = match BotConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chatbotd: {}", e);
            process::exit(1);
        }
    };

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::from_str(&config.logging.level).unwrap_or(tracing::Level::INFO)
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Err(e) = install_shutdown_handler() {
        error!("cannot install signal handlers: {}", e);
        process::exit(1);
    }

    let mut core = match BotCore::new(config, modules::builders(), Arc::new(IrcSessionFactory)) {
        Ok(core) => core,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    if let Err(e) = core.start() {
        error!("{}", e);
        core.shutdown();
        process::exit(1);
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(REAP_INTERVAL);
        core.reap();
    }
    core.shutdown();
}

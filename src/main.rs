//! CLI entrypoint for `gladius`.
//!
//! Loads the TOML configuration, verifies the cracking engines, assembles the
//! stage graph and runs it until interrupted. On shutdown the watches are
//! removed, launched engines are left running, and the hash store is exported
//! as CSV into the project directory.
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use gladius::{
    config::{Config, DEFAULT_CONFIG_FILE},
    cracker::{CrackError, CrackInvoker},
    export::{CredentialSink, save_hash_store_csv},
    graph::PipelineGraph,
    render::{CredentialRenderer, Style},
    stage::StageContext,
    store::HashStore,
};
use log::{LevelFilter, error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "gladius",
    version,
    about = "Watch capture tool output, crack new hashes, report recovered credentials"
)]
struct Args {
    /// Path to the TOML configuration
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print recovered credentials as plain lines instead of swords
    #[arg(long = "no-art")]
    no_art: bool,

    /// Control color output (auto, always, never)
    #[arg(long = "color", value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

const BANNER: &str = r#"
   ___ _          _ _
  / __| |__ _ __| (_)_  _ ___
 | (_ | / _` / _` | | || (_-<
  \___|_\__,_\__,_|_|\_,_/__/
"#;

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

fn export_store(store: &HashStore, cfg: &Config) -> Result<PathBuf> {
    let ts = chrono::Local::now().format("%Y.%m.%d_%H.%M.%S");
    let path = cfg.project.path.join(format!("gladius_hashes_{}.csv", ts));
    save_hash_store_csv(store, &path).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

fn main() {
    let args = Args::parse();
    init_logger(args.verbose);
    match args.color {
        ColorChoice::Always => {
            colored::control::set_override(true);
        }
        ColorChoice::Never => {
            colored::control::set_override(false);
        }
        ColorChoice::Auto => {}
    }

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let invoker = CrackInvoker::new(cfg.hashcat.clone(), cfg.john.clone());
    if let Err(e) = invoker.verify() {
        error!("{}", e);
        let code = match e {
            CrackError::Outdated(..) => 3,
            _ => 2,
        };
        std::process::exit(code);
    }
    if cfg.john.is_none() {
        warn!("no [john] section; cached logon hashes will not be cracked");
    }

    let style = if args.no_art {
        println!("{}", "Awe, no swords? Okay, fine..".yellow());
        Style::Plain
    } else {
        Style::Art
    };
    let store = Arc::new(HashStore::new());
    let ctx = Arc::new(StageContext {
        store: Arc::clone(&store),
        invoker,
        renderer: CredentialRenderer::new(style),
        sink: CredentialSink::in_dir(&cfg.creds_dir()),
    });

    let mut graph = match PipelineGraph::from_config(&cfg, ctx) {
        Ok(g) => g,
        Err(e) => {
            error!("invalid pipeline: {}", e);
            std::process::exit(2);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        error!("failed to set Ctrl+C handler: {}", e);
        std::process::exit(4);
    }

    if let Err(e) = graph.start() {
        error!("failed to start watchers: {}", e);
        std::process::exit(4);
    }
    println!("{}", BANNER.bold().red());
    for stage in graph.stages() {
        println!(
            "{} {} ({})",
            "[-] Watching".blue(),
            stage.watch_dir.display(),
            stage.patterns.join(", ")
        );
    }

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
    }

    info!("shutting down; launched engines keep running");
    graph.stop();
    let stats = store.snapshot_stats();
    println!(
        "{} {}/{} users cracked ({})",
        "[*]".yellow(),
        stats.cracked,
        stats.total,
        stats.percentage()
    );
    if !store.is_empty() {
        match export_store(&store, &cfg) {
            Ok(path) => info!("hash store written to {}", path.display()),
            Err(e) => error!("{:#}", e),
        }
    }
}

//! `lar` – interactive mapping shell.
//!
//! 1. Loads `~/.lar/config.toml`, writing the defaults on first run.
//! 2. Starts a mapping session in a fresh directory under the sessions root.
//! 3. Drops the user into a REPL driving a simulated device
//!    (`/walk`, `/snap`, `/localize`, `/save`, `/cockpit`, `/help`).
//! 4. Intercepts **Ctrl-C** so the session metadata is written before exit.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

fn main() {
    // Honors RUST_LOG and LAR_LOG_FORMAT=json; spans are exported when
    // OTEL_EXPORTER_OTLP_ENDPOINT is set.
    let _telemetry = lar_runtime::init_tracing("lar");

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!(
            "{}",
            "⚠  Ctrl-C received – finishing the session on the next prompt …"
                .yellow()
                .bold()
        );
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let shell = match repl::Shell::start(cfg) {
        Ok(shell) => shell,
        Err(e) => {
            eprintln!("{}: {}", "Startup failed".red().bold(), e);
            std::process::exit(1);
        }
    };

    println!(
        "  Session directory {}",
        shell.session_dir().display().to_string().bold()
    );
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(shell, shutdown);
}

fn first_run() -> config::Config {
    let cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    let mut cfg = cfg;
    config::apply_env_overrides(&mut cfg);
    cfg
}

fn print_banner() {
    println!();
    println!("{}", r#"   __                "#.bold().cyan());
    println!("{}", r#"  / /  ___ _ ____    "#.bold().cyan());
    println!("{}", r#" / /__/ _ `/ __/     "#.bold().cyan());
    println!("{}", r#"/____/\_,_/_/        "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "location-anchored mapping".dimmed(),
        concat!("v", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!();
}

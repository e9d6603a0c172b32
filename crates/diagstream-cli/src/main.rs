//! `diagstream-cli` – Live diagnostics console.
//!
//! This binary:
//!
//! 1. Checks for `~/.diagstream/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Probes the configured backend's `/health`.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/connect`, `/events`, `/emit`, `/serve`, `/help`, …).
//! 4. Intercepts **Ctrl-C** to unmount the viewer (disposing its feed) and
//!    exit.

mod config;
mod health;
mod repl;
mod telemetry;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

fn main() {
    let _telemetry = telemetry::init_tracing("diagstream");

    print_banner();

    // ── First-Run Wizard ──────────────────────────────────────────────────
    match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(_)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
        }
    }

    let cfg = config::load_or_default().unwrap_or_else(|_| {
        let mut cfg = config::Config::default();
        config::apply_env_overrides(&mut cfg);
        cfg
    });

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            eprintln!("{}: {}", "Fatal".red().bold(), e);
            std::process::exit(1);
        }
    };
    let session = repl::Session::new(rt, cfg);

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let viewer_slot = session.viewer_slot();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);

        let viewer = viewer_slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut viewer) = viewer {
            viewer.unmount();
            println!("{}", "  ✓ Feed disposed.".green());
        }
        println!("{}", "  ✓ Exiting diagstream.".green());
        // The REPL is blocked on stdin and would not notice the flag.
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the feed will not be disposed on Ctrl-C");
    }

    // ── Backend probe ─────────────────────────────────────────────────────
    print!("\n  Probing backend at {} … ", session.endpoints().base().dimmed());
    std::io::Write::flush(&mut std::io::stdout()).ok();
    match session.runtime().block_on(health::fetch(session.endpoints())) {
        Ok(h) => println!("{} (env {})", "online".green(), h.env.bold()),
        Err(_) => {
            println!("{}", "offline".yellow());
            println!(
                "  {}  Run `{}` to start a local backend.",
                "No diagnostics backend detected.".dimmed(),
                "/serve".bold()
            );
        }
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(session, shutdown);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║     diagstream First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up diagstream.\n");

    let mut cfg = config::Config::default();
    config::apply_env_overrides(&mut cfg);

    cfg.api_base_url = repl::prompt_str(
        &format!("  Diagnostics backend URL [{}]: ", cfg.api_base_url),
        &cfg.api_base_url,
    );

    let port_str = repl::prompt_str(
        &format!("  Local server port for /serve [{}]: ", cfg.server_port),
        &cfg.server_port.to_string(),
    );
    if let Ok(p) = port_str.trim().parse::<u16>() {
        cfg.server_port = p;
    }

    let cap_str = repl::prompt_str(
        &format!("  Events to keep in the viewer [{}]: ", cfg.log_capacity),
        &cfg.log_capacity.to_string(),
    );
    if let Ok(cap) = cap_str.trim().parse::<usize>()
        && cap > 0
    {
        cfg.log_capacity = cap;
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"     ___                  __                        "#.bold().cyan());
    println!("{}", r#"  __/ (_)__ ____ ____ ___/ /________ ___ ___ _  ___ "#.bold().cyan());
    println!("{}", r#" / _  / / _ `/ _ `(_-</ __/ __/ -_) _ `/  ' \/ _ \"#.bold().cyan());
    println!("{}", r#" \_,_/_/\_,_/\_, /___/\__/_/  \__/\_,_/_/_/_/\___/"#.bold().cyan());
    println!("{}", r#"            /___/                                   "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "diagstream".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Live agent diagnostics console");
    println!();
}

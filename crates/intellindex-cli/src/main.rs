//! `intellindex` – Intelligent Index command line interface.
//!
//! This binary is the interactive front end for the report workflow.  It:
//!
//! 1. Checks for `~/.intellindex/config.toml`; runs a **First-Run Wizard**
//!    when the file is absent.
//! 2. Probes the configured model server and reports available models.
//! 3. Opens the index database and drops the user into an **interactive
//!    REPL** for submitting batches, reviewing drafts and inspecting memory.
//! 4. Intercepts **Ctrl-C** and exits at the next prompt.  Runs awaiting
//!    review are checkpointed, so nothing is lost.

mod config;
mod ollama;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use intellindex_runtime::{IntelligentIndex, init_tracing};

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the level, INTELLINDEX_LOG_FORMAT=json switches to
    // newline-delimited JSON and OTEL_EXPORTER_OTLP_ENDPOINT enables span
    // export.  User-facing output still goes through println!.
    let _tracing_guard = init_tracing("intellindex");

    print_banner();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – exiting after the current command …".yellow().bold());
        println!("{}", "  ✓ Pending runs stay checkpointed.".green());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── First-Run Wizard ──────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Model discovery ───────────────────────────────────────────────────
    print!("\n  Probing model server at {} … ", cfg.llm_url.dimmed());
    match ollama::fetch_models(&cfg.llm_url) {
        Ok(models) => {
            println!("{} ({} model(s) available)", "online".green(), models.len());
            for m in &models {
                let marker = if m.name == cfg.report_model || m.name == cfg.memory_model { "▶" } else { " " };
                println!("    {} {}", marker.green(), m.name.bold());
            }
        }
        Err(_) => {
            println!("{}", "offline".yellow());
            println!(
                "  {}  Run `{}` to start a local AI.",
                "No Ollama instance detected.".dimmed(),
                "ollama serve".bold()
            );
        }
    }

    // ── Index ─────────────────────────────────────────────────────────────
    if let Some(parent) = std::path::Path::new(&cfg.db_path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(error = %e, path = %parent.display(), "could not create database directory");
        }
    }
    let index = match IntelligentIndex::new(cfg.to_index_config()) {
        Ok(index) => index,
        Err(e) => {
            error!(error = %e, db_path = %cfg.db_path, "failed to open the index");
            println!("{}: {}", "Failed to open the index".red(), e);
            std::process::exit(1);
        }
    };
    info!(db_path = %cfg.db_path, report_model = %cfg.report_model, "index opened");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    match index.pending_namespaces() {
        Ok(pending) if !pending.is_empty() => println!(
            "\n  {} run(s) awaiting review: {}",
            pending.len().to_string().yellow(),
            pending.join(", ").bold()
        ),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "could not list pending runs"),
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&rt, &index, shutdown);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║    Intelligent Index First-Run       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set things up.\n");

    let mut cfg = config::Config::default();

    cfg.llm_url = repl::prompt_str(
        &format!("  OpenAI-compatible model server URL [{}]: ", cfg.llm_url),
        &cfg.llm_url,
    );
    cfg.report_model =
        repl::prompt_str(&format!("  Model for drafting reports [{}]: ", cfg.report_model), &cfg.report_model);
    cfg.memory_model =
        repl::prompt_str(&format!("  Model for memory upkeep [{}]: ", cfg.memory_model), &cfg.memory_model);
    cfg.api_key = repl::prompt_str("  API key (leave empty for local servers): ", "");
    cfg.db_path = repl::prompt_str(&format!("  Database path [{}]: ", cfg.db_path), &cfg.db_path);

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }

    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____      __       ____ ____          __        "#.bold().cyan());
    println!("{}", r#"  /  _/__  / /____  / / // __/__  ___/ /____ __  "#.bold().cyan());
    println!("{}", r#" _/ // _ \/ __/ -_)/ / /_/ / _ \/ _  / -_) \ /  "#.bold().cyan());
    println!("{}", r#"/___/_//_/\__/\__//_/_/___/_//_/\_,_/\__/_\_\   "#.bold().cyan());
    println!();
    println!("  {} {}",
        "Intelligent Index".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Human-reviewed reports with layered memory");
    println!();
}

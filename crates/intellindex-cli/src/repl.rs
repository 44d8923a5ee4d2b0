//! REPL – Read-Eval-Print Loop for the interactive index shell.
//!
//! Supported slash-commands:
//!   /submit <ns> <date> <content>   – start a report run from one record
//!   /submit-file <ns> <path.json>   – start a report run from a JSON batch
//!   /approve <ns>                   – approve the pending report
//!   /feedback <ns> <text>           – request a refinement
//!   /pending [ns]                   – show pending runs
//!   /cancel <ns>                    – discard the pending run
//!   /instructions <ns> [text]       – show or replace report instructions
//!   /stm <ns> [text]                – show or replace the short-term report
//!   /episodes <ns>                  – list stored episodes
//!   /archive <query>                – search archived reports
//!   /models                         – list / switch the report model
//!   /settings                       – edit `~/.intellindex/config.toml`
//!   /help                           – show this list
//!   /quit | /exit                   – exit the CLI

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use intellindex_runtime::IntelligentIndex;
use intellindex_types::{IndexError, ResumeInput, RunOutcome, WorkItem};
use tokio::runtime::Runtime;

use crate::config::{self, Config};
use crate::ollama;

/// A parsed slash-command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Submit { namespace: String, items: Vec<WorkItem> },
    SubmitFile { namespace: String, path: String },
    Approve { namespace: String },
    Feedback { namespace: String, text: String },
    Pending { namespace: Option<String> },
    Cancel { namespace: String },
    Instructions { namespace: String, text: Option<String> },
    Stm { namespace: String, text: Option<String> },
    Episodes { namespace: String },
    Archive { query: String },
    Models,
    Settings,
    Help,
    Quit,
}

/// Split `s` into its first whitespace-delimited word and the trimmed rest.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn require<'a>(value: &'a str, usage: &str) -> Result<&'a str, String> {
    if value.is_empty() { Err(format!("usage: {usage}")) } else { Ok(value) }
}

/// Parse one input line into a [`Command`].
pub fn parse_command(line: &str) -> Result<Command, String> {
    let (head, rest) = split_word(line);
    let optional = |s: &str| (!s.is_empty()).then(|| s.to_string());

    match head {
        "/submit" => {
            const USAGE: &str = "/submit <namespace> <date> <content>";
            let (ns, rest) = split_word(rest);
            let (date, content) = split_word(rest);
            let namespace = require(ns, USAGE)?.to_string();
            require(date, USAGE)?;
            require(content, USAGE)?;
            let items = vec![WorkItem::new(namespace.clone(), date, content)];
            Ok(Command::Submit { namespace, items })
        }
        "/submit-file" => {
            const USAGE: &str = "/submit-file <namespace> <path.json>";
            let (ns, path) = split_word(rest);
            Ok(Command::SubmitFile {
                namespace: require(ns, USAGE)?.to_string(),
                path: require(path, USAGE)?.to_string(),
            })
        }
        "/approve" => Ok(Command::Approve {
            namespace: require(split_word(rest).0, "/approve <namespace>")?.to_string(),
        }),
        "/feedback" => {
            const USAGE: &str = "/feedback <namespace> <text>";
            let (ns, text) = split_word(rest);
            Ok(Command::Feedback {
                namespace: require(ns, USAGE)?.to_string(),
                text: require(text, USAGE)?.to_string(),
            })
        }
        "/pending" => Ok(Command::Pending { namespace: optional(split_word(rest).0) }),
        "/cancel" => Ok(Command::Cancel {
            namespace: require(split_word(rest).0, "/cancel <namespace>")?.to_string(),
        }),
        "/instructions" => {
            let (ns, text) = split_word(rest);
            Ok(Command::Instructions {
                namespace: require(ns, "/instructions <namespace> [text]")?.to_string(),
                text: optional(text),
            })
        }
        "/stm" => {
            let (ns, text) = split_word(rest);
            Ok(Command::Stm {
                namespace: require(ns, "/stm <namespace> [text]")?.to_string(),
                text: optional(text),
            })
        }
        "/episodes" => Ok(Command::Episodes {
            namespace: require(split_word(rest).0, "/episodes <namespace>")?.to_string(),
        }),
        "/archive" => Ok(Command::Archive {
            query: require(rest, "/archive <query>")?.to_string(),
        }),
        "/models" => Ok(Command::Models),
        "/settings" => Ok(Command::Settings),
        "/help" => Ok(Command::Help),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command: '{other}'")),
    }
}

/// Read a JSON array of work items from `path`.
///
/// Items without a namespace inherit `namespace`.
pub fn load_batch(path: &str, namespace: &str) -> Result<Vec<WorkItem>, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("Failed to read {path}: {e}"))?;
    let mut items: Vec<WorkItem> =
        serde_json::from_str(&raw).map_err(|e| format!("Failed to parse {path}: {e}"))?;
    for item in &mut items {
        item.namespace.get_or_insert_with(|| namespace.to_string());
    }
    Ok(items)
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(rt: &Runtime, index: &IntelligentIndex, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "intellindex>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        let command = match parse_command(&line) {
            Ok(c) => c,
            Err(e) => {
                println!("{} Type {} for available commands.", e.red(), "/help".bold());
                continue;
            }
        };

        let result = match command {
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Command::Help => {
                cmd_help();
                Ok(())
            }
            Command::Settings => {
                cmd_settings();
                Ok(())
            }
            Command::Models => {
                cmd_models();
                Ok(())
            }
            Command::Submit { namespace, items } => rt
                .block_on(index.submit(&namespace, items))
                .map(|out| print_outcome(&namespace, &out)),
            Command::SubmitFile { namespace, path } => match load_batch(&path, &namespace) {
                Ok(items) => rt
                    .block_on(index.submit(&namespace, items))
                    .map(|out| print_outcome(&namespace, &out)),
                Err(e) => {
                    println!("{}", e.red());
                    Ok(())
                }
            },
            Command::Approve { namespace } => rt
                .block_on(index.resume(&namespace, ResumeInput::approve()))
                .map(|out| print_outcome(&namespace, &out)),
            Command::Feedback { namespace, text } => rt
                .block_on(index.resume(&namespace, ResumeInput::feedback(text)))
                .map(|out| print_outcome(&namespace, &out)),
            Command::Pending { namespace } => cmd_pending(rt, index, namespace.as_deref()),
            Command::Cancel { namespace } => rt.block_on(index.cancel(&namespace)).map(|dropped| {
                if dropped {
                    println!("{} pending run for {} discarded", "✓".green(), namespace.bold());
                } else {
                    println!("  No pending run for {}", namespace.bold());
                }
            }),
            Command::Instructions { namespace, text: Some(text) } => index
                .set_instructions(&namespace, &text)
                .map(|()| println!("{} instructions for {} updated", "✓".green(), namespace.bold())),
            Command::Instructions { namespace, text: None } => index
                .get_instructions(&namespace)
                .map(|text| print_block("Instructions", &namespace, &text)),
            Command::Stm { namespace, text: Some(text) } => index
                .set_stm(&namespace, &text)
                .map(|()| println!("{} short-term report for {} updated", "✓".green(), namespace.bold())),
            Command::Stm { namespace, text: None } => match index.get_stm(&namespace) {
                Err(IndexError::NotFound(_)) => {
                    println!("  No short-term report for {} yet.", namespace.bold());
                    Ok(())
                }
                other => other.map(|text| print_block("Short-term report", &namespace, &text)),
            },
            Command::Episodes { namespace } => index.episodes(&namespace).map(|episodes| {
                if episodes.is_empty() {
                    println!("  No episodes stored for {}.", namespace.bold());
                }
                for stored in episodes {
                    println!(
                        "  {} {}",
                        stored.recorded_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
                        stored.episode.observation.bold()
                    );
                    println!("    action : {}", stored.episode.action);
                    println!("    result : {}", stored.episode.result);
                }
            }),
            Command::Archive { query } => index.query_archive(&query, None).map(|hits| {
                if hits.is_empty() {
                    println!("  Archive has no matching reports.");
                }
                for hit in hits {
                    println!(
                        "  {} [{}] {}",
                        format!("{:.3}", hit.score).yellow(),
                        hit.namespace.bold(),
                        hit.inserted_at.format("%Y-%m-%d").to_string().dimmed()
                    );
                    println!("    {}", first_line(&hit.text));
                }
            }),
        };

        if let Err(e) = result {
            print_error(&e);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Intelligent Index Commands".bold().underline());
    println!("  {} – start a run from one record", "/submit <ns> <date> <content>".bold().cyan());
    println!("  {} – start a run from a JSON array of records", "/submit-file <ns> <path>".bold().cyan());
    println!("  {}  – approve the pending report", "/approve <ns>".bold().cyan());
    println!("  {} – ask for a refinement", "/feedback <ns> <text>".bold().cyan());
    println!("  {}  – show runs awaiting review", "/pending [ns]".bold().cyan());
    println!("  {}   – discard the pending run", "/cancel <ns>".bold().cyan());
    println!("  {} – show or replace instructions", "/instructions <ns> [text]".bold().cyan());
    println!("  {} – show or replace the short-term report", "/stm <ns> [text]".bold().cyan());
    println!("  {} – list stored episodes", "/episodes <ns>".bold().cyan());
    println!("  {} – search archived reports", "/archive <query>".bold().cyan());
    println!("  {}        – list and switch models", "/models".bold().cyan());
    println!("  {}      – edit ~/.intellindex/config.toml", "/settings".bold().cyan());
    println!("  {}  – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_pending(rt: &Runtime, index: &IntelligentIndex, namespace: Option<&str>) -> Result<(), IndexError> {
    let namespaces = match namespace {
        Some(ns) => vec![ns.to_string()],
        None => index.pending_namespaces()?,
    };
    let mut shown = 0;
    for ns in namespaces {
        if let Some(review) = rt.block_on(index.pending(&ns))? {
            shown += 1;
            print_block("Awaiting review", &ns, &review.report);
        }
    }
    if shown == 0 {
        println!("  No runs awaiting review.");
    }
    Ok(())
}

fn cmd_settings() {
    let mut cfg = load_config_or_default();

    println!("{}", "Settings Editor".bold().underline());
    println!("  (press Enter to keep the current value; changes apply on restart)");

    cfg.llm_url = prompt_str(&format!("  Model server URL [{}]: ", cfg.llm_url), &cfg.llm_url);
    cfg.report_model = prompt_str(&format!("  Report model     [{}]: ", cfg.report_model), &cfg.report_model);
    cfg.memory_model = prompt_str(&format!("  Memory model     [{}]: ", cfg.memory_model), &cfg.memory_model);
    cfg.db_path = prompt_str(&format!("  Database path    [{}]: ", cfg.db_path), &cfg.db_path);
    cfg.archive_top_k = prompt_usize(&format!("  Archive top-k    [{}]: ", cfg.archive_top_k), cfg.archive_top_k);
    cfg.reflection_steps =
        prompt_usize(&format!("  Reflection steps [{}]: ", cfg.reflection_steps), cfg.reflection_steps);

    match config::save(&cfg) {
        Ok(()) => println!(
            "{} {}",
            "✓ Settings saved to".green(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

fn cmd_models() {
    let cfg = load_config_or_default();

    println!("{}", "AI Models".bold().underline());
    println!("  Report model : {}", cfg.report_model.yellow());
    println!("  Memory model : {}", cfg.memory_model.yellow());

    print!("  Probing {} … ", cfg.llm_url.dimmed());
    io::stdout().flush().ok();

    match ollama::fetch_models(&cfg.llm_url) {
        Ok(models) if models.is_empty() => {
            println!("{}", "no models found".yellow());
            println!("  Run `ollama pull llama3` to download a model.");
        }
        Ok(models) => {
            println!("{}", "online".green());
            println!("  Available local models:");
            for m in &models {
                let marker = if m.name == cfg.report_model { "▶" } else { " " };
                println!("    {} {}", marker.green(), m.name.bold());
            }

            let new_model =
                prompt_str(&format!("  Switch report model to [{}]: ", cfg.report_model), &cfg.report_model);
            if new_model != cfg.report_model {
                if models.iter().any(|m| m.name == new_model) {
                    let new_cfg = Config { report_model: new_model.clone(), ..cfg };
                    match config::save(&new_cfg) {
                        Ok(()) => println!(
                            "{} {} (applies on restart)",
                            "✓ Report model set to".green(),
                            new_model.bold()
                        ),
                        Err(e) => println!("{}: {}", "Error saving config".red(), e),
                    }
                } else {
                    println!("{} '{}'", "Unknown model:".red(), new_model.yellow());
                }
            }
        }
        Err(e) => {
            println!("{}", "offline".red());
            println!("  {}", e.dimmed());
            println!("  Is Ollama running?  Try: ollama serve");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn print_outcome(namespace: &str, outcome: &RunOutcome) {
    if let Some(review) = &outcome.pending_question {
        print_block("Draft report", namespace, &review.report);
        println!("  {}", review.question.italic());
        println!(
            "  Use {} or {}.",
            format!("/approve {namespace}").bold().cyan(),
            format!("/feedback {namespace} <text>").bold().cyan()
        );
    } else if let Some(report) = &outcome.result {
        print_block("Final report", namespace, report);
        println!("  {} run complete", "✓".green().bold());
    }
}

fn print_block(title: &str, namespace: &str, body: &str) {
    println!();
    println!("{} {}", format!("{title}:").bold().underline(), namespace.bold());
    for line in body.lines() {
        println!("  {line}");
    }
    println!();
}

fn print_error(e: &IndexError) {
    let label = if e.is_client_error() { "Rejected" } else { "Error" };
    println!("{} ({}): {}", label.red(), e.kind(), e);
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("")
}

fn load_config_or_default() -> Config {
    match config::load() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            println!("{}: {} – using defaults", "Config error".red(), e);
            Config::default()
        }
    }
}

fn prompt_usize(msg: &str, default: usize) -> usize {
    let raw = prompt_str(msg, &default.to_string());
    match raw.parse::<usize>() {
        Ok(v) => v,
        Err(_) => {
            println!("  {} '{}' is not a number, keeping {}", "Warning:".yellow(), raw, default);
            default
        }
    }
}

/// Prompt for a string value.  Returns `default` when the user presses Enter.
pub(crate) fn prompt_str(msg: &str, default: &str) -> String {
    print!("{}", msg);
    io::stdout().flush().ok();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() { default.to_string() } else { trimmed }
        }
        Err(_) => default.to_string(),
    }
}

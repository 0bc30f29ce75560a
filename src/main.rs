//! Thin CLI layer: parse args, styled output, and call into dml-core.
//! Crash-proof: panic caught and reported; all errors return Result.

use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use dml_core::{load_config, Config, DynamicModuleLoader, LoadOptions, NativeLoader};
use indicatif::{ProgressBar, ProgressStyle};
use std::env;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal() && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn info(msg: &str) {
    if use_color() {
        println!("{}", msg.cyan());
    } else {
        println!("{}", msg);
    }
}

fn dim(msg: &str) {
    if use_color() {
        println!("{}", msg.dimmed());
    } else {
        println!("{}", msg);
    }
}

/// Spinner on stderr while a pipeline runs; hidden when stderr isn't a TTY.
fn spinner(message: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠁⠂⠄⠈⠐⠠⠰⠸⠹")
        .template("{spinner:.dim} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Log to stderr; filter from DML_LOG (e.g. DML_LOG=dml_core=debug), default warn.
fn init_logging() {
    let filter = EnvFilter::try_from_env("DML_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn scope_arg() -> Arg {
    Arg::new("scope")
        .long("scope")
        .value_name("DIR")
        .help("Sub-directory namespacing the lock and installation path")
}

fn cli() -> Command {
    Command::new("dml")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Dynamic module loader: fetch, unpack, install and load modules at runtime")
        .after_help(
            "Examples:\n  dml load my-module\n  dml load my-module --extension .zip\n  dml load my-module --url https://pkgs.example.com/my-module.tar.gz\n  dml evict my-module\n  dml config --json",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("load")
                .about("Download, install and load a module (skips whatever is already done)")
                .arg(Arg::new("name").required(true).help("Module name"))
                .arg(
                    Arg::new("extension")
                        .long("extension")
                        .short('e')
                        .value_parser([".tar.gz", ".zip"])
                        .help("Package format (default from config)"),
                )
                .arg(
                    Arg::new("url")
                        .long("url")
                        .help("Full download URL; bypasses <packageServerUrl>/<name><extension>"),
                )
                .arg(scope_arg())
                .arg(
                    Arg::new("quiet")
                        .short('q')
                        .long("quiet")
                        .action(ArgAction::SetTrue)
                        .help("Minimal output; show spinner when busy"),
                ),
        )
        .subcommand(
            Command::new("evict")
                .about("Evict a module so the next load reads it from disk again")
                .arg(Arg::new("name").required(true).help("Module name"))
                .arg(scope_arg()),
        )
        .subcommand(
            Command::new("config")
                .about("Show the effective configuration (.dmlrc + DML_* env + defaults)")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output machine-readable JSON"),
                ),
        )
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Runtime::new().map_err(|e| format!("Failed to start runtime: {}", e))
}

fn loader(config: Config) -> DynamicModuleLoader {
    DynamicModuleLoader::with_file_locks(config, Arc::new(NativeLoader::new()))
}

fn cmd_load(config: Config, m: &ArgMatches) -> Result<(), String> {
    let name = m.get_one::<String>("name").cloned().unwrap_or_default();
    let quiet = m.get_flag("quiet");
    let mut opts = LoadOptions::new();
    if let Some(ext) = m.get_one::<String>("extension") {
        opts = opts.extension(ext.clone());
    }
    if let Some(url) = m.get_one::<String>("url") {
        opts = opts.url(url.clone());
    }
    if let Some(scope) = m.get_one::<String>("scope") {
        opts = opts.scope(scope.clone());
    }

    if !quiet {
        info(&format!("Loading {} …", name));
    }
    let loader = loader(config);
    let pb = if quiet {
        spinner(&format!("Loading {}", name))
    } else {
        ProgressBar::hidden()
    };
    let result = runtime()?.block_on(loader.load(&name, opts));
    pb.finish_and_clear();

    let module = result.map_err(|e| e.to_string())?;
    success(&format!("Loaded {}", name));
    if !quiet {
        dim(&format!("  entry point: {}", module.entry_point().display()));
        if let Some(display) = module.name() {
            dim(&format!("  name: {}", display));
        }
    }
    Ok(())
}

fn cmd_evict(config: Config, m: &ArgMatches) -> Result<(), String> {
    let name = m.get_one::<String>("name").cloned().unwrap_or_default();
    let scope = m.get_one::<String>("scope").map(String::as_str);
    let loader = loader(config);
    let evicted = runtime()?
        .block_on(loader.evict(&name, scope))
        .map_err(|e| e.to_string())?;
    success(&format!("Evicted {}", evicted));
    Ok(())
}

fn cmd_config(config: &Config, m: &ArgMatches) -> Result<(), String> {
    if m.get_flag("json") {
        let json = serde_json::to_string_pretty(config).map_err(|e| e.to_string())?;
        println!("{}", json);
        return Ok(());
    }
    let value = serde_json::to_value(config).map_err(|e| e.to_string())?;
    if let serde_json::Value::Object(map) = value {
        for (key, v) in map {
            let shown = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => "(unset)".to_string(),
                other => other.to_string(),
            };
            println!("{}: {}", key, shown);
        }
    }
    Ok(())
}

fn run() -> Result<(), String> {
    let matches = cli().get_matches();
    init_logging();

    let cwd = env::current_dir().map_err(|e| e.to_string())?;
    let config = load_config(&cwd);

    match matches.subcommand() {
        Some(("load", sub)) => cmd_load(config, sub),
        Some(("evict", sub)) => cmd_evict(config, sub),
        Some(("config", sub)) => cmd_config(&config, sub),
        _ => Err("Unknown command. Run dml --help.".to_string()),
    }
}

fn main() {
    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error(&e);
            1
        }
        Err(_) => {
            error("An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}

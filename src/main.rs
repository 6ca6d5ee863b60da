//! ptyshot - capture text screenshots of TUI applications
//!
//! Runs a command in a virtual terminal, optionally sends keys, waits for the
//! screen to settle and prints what a user would see.
//!
//! # Quick Start
//!
//! ```text
//! ptyshot -- ./my-tui-app                      # capture after 500ms
//! ptyshot --cols 120 --rows 40 -- ./my-tui-app
//! ptyshot --keys "j j enter" -- ./my-tui-app
//! ptyshot --wait-for "Main Menu" -- ./my-tui-app
//! ptyshot --assert Welcome --quiet -- ./my-tui-app
//! ptyshot --keys "down enter" --capture-each --format json -- ./my-tui-app
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error |
//! | 2 | Timeout |
//! | 3 | Assertion failed |
//! | 4 | Command exited with non-zero status |

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ptyshot::capture::{self, CaptureOptions, OutputFormat};
use ptyshot::config::{parse_duration, Config};
use ptyshot::core::SessionOptions;

/// Capture text screenshots of TUI applications
#[derive(Parser, Debug)]
#[command(name = "ptyshot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Terminal width in columns
    #[arg(long)]
    cols: Option<usize>,

    /// Terminal height in rows
    #[arg(long)]
    rows: Option<usize>,

    /// Initial delay before first capture
    #[arg(long, value_parser = parse_duration)]
    delay: Option<Duration>,

    /// Timeout waiting for stable screen
    #[arg(long, value_parser = parse_duration)]
    stable_timeout: Option<Duration>,

    /// Duration the screen must be unchanged to count as stable
    #[arg(long, value_parser = parse_duration)]
    stable_time: Option<Duration>,

    /// Wait for this text to appear before capturing
    #[arg(long, value_name = "TEXT")]
    wait_for: Option<String>,

    /// Keys to send, space-separated ("down down enter") or literal text
    #[arg(long, default_value = "")]
    keys: String,

    /// Read keys from stdin, one per line
    #[arg(long)]
    keys_stdin: bool,

    /// Output format
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Overall timeout for the operation
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Text that must appear on the final screen (exit 3 if missing)
    #[arg(long = "assert", value_name = "TEXT")]
    asserts: Vec<String>,

    /// Text to look for; reported in the JSON `checks` object
    #[arg(long = "check", value_name = "TEXT")]
    checks: Vec<String>,

    /// Capture the screen after each key
    #[arg(long)]
    capture_each: bool,

    /// Trim trailing blank lines
    #[arg(long)]
    trim: bool,

    /// Print nothing on success
    #[arg(long)]
    quiet: bool,

    /// Wait for the screen to stabilize before sending keys
    #[arg(long)]
    wait_stable: bool,

    /// Write output to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Environment variable for the command (KEY=VALUE)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Delay between keystrokes
    #[arg(long, value_parser = parse_duration)]
    input_delay: Option<Duration>,

    /// Config file (default: ~/.ptyshot/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Command to run, followed by its arguments
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    /// Merge flags over config values
    fn into_options(self, config: Config) -> (String, Vec<String>, CaptureOptions) {
        let mut env = config.env;
        env.extend(self.env);

        let options = CaptureOptions {
            session: SessionOptions {
                rows: self.rows.unwrap_or(config.rows),
                cols: self.cols.unwrap_or(config.cols),
                env,
                term: config.term,
            },
            delay: self.delay.unwrap_or(config.delay),
            stable_timeout: self.stable_timeout.unwrap_or(config.stable_timeout),
            stable_time: self.stable_time.unwrap_or(config.stable_time),
            wait_for: self.wait_for,
            keys: self.keys,
            keys_stdin: self.keys_stdin,
            format: self.format.unwrap_or(config.format),
            timeout: self.timeout.unwrap_or(config.timeout),
            asserts: self.asserts,
            checks: self.checks,
            capture_each: self.capture_each,
            trim: self.trim || config.trim,
            quiet: self.quiet,
            wait_stable: self.wait_stable,
            output: self.output,
            input_delay: self.input_delay.unwrap_or(config.input_delay),
        };

        let mut command = self.command.into_iter();
        let program = command.next().unwrap_or_default();
        (program, command.collect(), options)
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    let log_file = cli.log_file.clone().or_else(|| config.log_file.clone());
    init_logging(config.log_level.as_deref(), log_file.as_deref())?;
    debug!(?config, "configuration loaded");

    let (program, args, options) = cli.into_options(config);
    if program.is_empty() {
        anyhow::bail!("no command specified");
    }

    info!(command = %program, ?args, "ptyshot starting");
    let outcome = capture::run(&program, &args, &options);
    info!(?outcome, "ptyshot finished");
    Ok(outcome.code())
}

/// Log to stderr, or append to `log_file` without colours
fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_env("PTYSHOT_LOG") {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level.unwrap_or("warn"))
            .with_context(|| format!("invalid log level {:?}", level.unwrap_or("warn")))?,
    };

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                let _ = fs::create_dir_all(parent);
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_after_separator() {
        let cli = Cli::try_parse_from(["ptyshot", "--cols", "120", "--", "vim", "-u", "NONE"]).unwrap();
        let (program, args, options) = cli.into_options(Config::default());
        assert_eq!(program, "vim");
        assert_eq!(args, vec!["-u".to_string(), "NONE".to_string()]);
        assert_eq!(options.session.cols, 120);
        assert_eq!(options.session.rows, 24);
    }

    #[test]
    fn test_missing_command_rejected() {
        assert!(Cli::try_parse_from(["ptyshot", "--cols", "80"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let config = Config {
            rows: 40,
            delay: Duration::from_secs(2),
            format: OutputFormat::Json,
            env: vec!["A=1".to_string()],
            ..Config::default()
        };
        let cli = Cli::try_parse_from([
            "ptyshot",
            "--delay",
            "250ms",
            "--format",
            "text",
            "--env",
            "B=2",
            "--assert",
            "x",
            "--assert",
            "y",
            "--",
            "top",
        ])
        .unwrap();
        let (_, _, options) = cli.into_options(config);
        assert_eq!(options.session.rows, 40);
        assert_eq!(options.delay, Duration::from_millis(250));
        assert_eq!(options.format, OutputFormat::Text);
        assert_eq!(options.session.env, vec!["A=1".to_string(), "B=2".to_string()]);
        assert_eq!(options.asserts, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_bad_duration_rejected() {
        assert!(Cli::try_parse_from(["ptyshot", "--timeout", "soon", "--", "top"]).is_err());
    }
}

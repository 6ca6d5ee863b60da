//! Capture workflow behind the `ptyshot` binary.
//!
//! Starts the command in a [`Session`], waits for it to settle, sends keys,
//! captures the screen, evaluates checks/assertions and writes the result
//! as plain text or JSON.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{wait_for_stable, wait_for_text, Session, SessionOptions};
use crate::keys::{parse_key, split_keys};

/// How a run ended; maps onto the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    GeneralError,
    Timeout,
    AssertionFailed,
    /// The command exited on its own with a non-zero status
    CommandFailed,
}

impl Outcome {
    pub fn code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::GeneralError => 1,
            Outcome::Timeout => 2,
            Outcome::AssertionFailed => 3,
            Outcome::CommandFailed => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub session: SessionOptions,
    pub delay: Duration,
    pub stable_timeout: Duration,
    pub stable_time: Duration,
    pub wait_for: Option<String>,
    /// Space-separated key specification
    pub keys: String,
    pub keys_stdin: bool,
    pub format: OutputFormat,
    pub timeout: Duration,
    pub asserts: Vec<String>,
    pub checks: Vec<String>,
    pub capture_each: bool,
    pub trim: bool,
    pub quiet: bool,
    pub wait_stable: bool,
    pub output: Option<PathBuf>,
    pub input_delay: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            delay: Duration::from_millis(500),
            stable_timeout: Duration::from_secs(5),
            stable_time: Duration::from_millis(200),
            wait_for: None,
            keys: String::new(),
            keys_stdin: false,
            format: OutputFormat::Text,
            timeout: Duration::from_secs(30),
            asserts: Vec::new(),
            checks: Vec::new(),
            capture_each: false,
            trim: false,
            quiet: false,
            wait_stable: false,
            output: None,
            input_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureResult {
    pub screen: String,
    pub cols: u16,
    pub rows: u16,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub cursor_visible: bool,
    pub timestamp: DateTime<Local>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingInfo>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingInfo {
    pub total_ms: u64,
    pub delay_ms: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub stabilize_ms: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub wait_for_text_ms: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub keys_ms: u64,
}

/// Result of `--capture-each`
#[derive(Debug, Clone, Serialize)]
pub struct MultiCaptureResult {
    pub captures: Vec<CaptureResult>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingInfo>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Run a capture with stdin as the key source and stdout as the sink
pub fn run(command: &str, args: &[String], options: &CaptureOptions) -> Outcome {
    let stdin = io::stdin();
    let stdout = io::stdout();
    run_with(command, args, options, &mut stdin.lock(), &mut stdout.lock())
}

pub fn run_with(
    command: &str,
    args: &[String],
    options: &CaptureOptions,
    keys_input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Outcome {
    let start = Instant::now();
    let mut timing = TimingInfo::default();

    let mut keys = options.keys.clone();
    if options.keys_stdin {
        match read_keys(keys_input) {
            Ok(extra) if keys.is_empty() => keys = extra,
            Ok(extra) => {
                keys.push(' ');
                keys.push_str(&extra);
            }
            Err(err) => {
                eprintln!("Error: reading keys from stdin: {}", err);
                return Outcome::GeneralError;
            }
        }
    }

    let session = match Session::new(command, args, &options.session) {
        Ok(session) => Arc::new(session),
        Err(err) => {
            eprintln!("Error: failed to create terminal: {}", err);
            return Outcome::GeneralError;
        }
    };
    let command_line = command_line(command, args);
    let watchdog = Watchdog::start(Arc::clone(&session), options.timeout);

    let delay_start = Instant::now();
    thread::sleep(options.delay);
    timing.delay_ms = millis(delay_start.elapsed());

    if let Some(text) = options.wait_for.as_deref().filter(|t| !t.is_empty()) {
        let wait_start = Instant::now();
        let result = wait_for_text(session.as_ref(), text, options.stable_timeout);
        timing.wait_for_text_ms = millis(wait_start.elapsed());
        if let Err(err) = result {
            if watchdog.fired() {
                eprintln!("Error: timeout waiting for text {:?}", text);
                return Outcome::Timeout;
            }
            eprintln!("Error: waiting for text {:?}: {}", text, err);
            return Outcome::GeneralError;
        }
    }

    if options.wait_stable {
        let stabilize_start = Instant::now();
        settle(&session, options);
        timing.stabilize_ms = millis(stabilize_start.elapsed());
    }

    let mut captures = Vec::new();
    if options.capture_each {
        captures.push(capture_screen(&session, &command_line, options.trim, None));
    }

    if !keys.is_empty() {
        let keys_start = Instant::now();
        for token in split_keys(&keys) {
            if let Err(err) = session.send_keys(&parse_key(token)) {
                eprintln!("Error: sending key {:?}: {}", token, err);
                return Outcome::GeneralError;
            }
            debug!(key = token, "sent key");
            thread::sleep(options.input_delay);
            if options.capture_each {
                settle(&session, options);
                captures.push(capture_screen(&session, &command_line, options.trim, None));
            }
        }
        if !options.capture_each {
            thread::sleep(options.stable_time);
        }
        timing.keys_ms = millis(keys_start.elapsed());
    }

    if !options.wait_stable {
        let stabilize_start = Instant::now();
        settle(&session, options);
        timing.stabilize_ms = millis(stabilize_start.elapsed());
    }

    timing.total_ms = millis(start.elapsed());

    let mut result = match captures.last() {
        Some(last) if options.capture_each => last.clone(),
        _ => capture_screen(&session, &command_line, options.trim, Some(timing.clone())),
    };

    if !options.checks.is_empty() {
        let checks: BTreeMap<String, bool> = options
            .checks
            .iter()
            .map(|text| (text.clone(), result.screen.contains(text.as_str())))
            .collect();
        for capture in &mut captures {
            capture.checks = Some(checks.clone());
        }
        result.checks = Some(checks);
    }

    let multi = options.capture_each.then(|| MultiCaptureResult {
        captures,
        command: command_line.clone(),
        timing: Some(timing),
    });

    if let Some(missing) = options.asserts.iter().find(|text| !result.screen.contains(text.as_str())) {
        eprintln!("Assertion failed: text {:?} not found on screen", missing);
        info!(text = %missing, "assertion failed");
        if !options.quiet {
            emit(&result, multi.as_ref(), options, out);
        }
        return Outcome::AssertionFailed;
    }

    if !options.quiet {
        emit(&result, multi.as_ref(), options, out);
    }

    if watchdog.fired() {
        return Outcome::Timeout;
    }
    match session.exit_status() {
        Some(status) if !status.success() => {
            info!(code = status.exit_code(), "command exited with failure");
            Outcome::CommandFailed
        }
        _ => Outcome::Success,
    }
}

/// Wait for a stable screen; a timeout just means we capture what is there
fn settle(session: &Session, options: &CaptureOptions) {
    if let Err(err) = wait_for_stable(session, options.stable_timeout, options.stable_time) {
        debug!(error = %err, "screen did not settle");
    }
}

fn capture_screen(
    session: &Session,
    command_line: &str,
    trim: bool,
    timing: Option<TimingInfo>,
) -> CaptureResult {
    let snapshot = session.snapshot();
    let screen = if trim {
        trim_trailing_blank_lines(&snapshot.text)
    } else {
        snapshot.text
    };
    CaptureResult {
        screen,
        cols: snapshot.cols,
        rows: snapshot.rows,
        cursor_row: snapshot.cursor_row,
        cursor_col: snapshot.cursor_col,
        cursor_visible: snapshot.cursor_visible,
        timestamp: Local::now(),
        command: command_line.to_string(),
        checks: None,
        timing,
    }
}

fn command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One key token per non-blank line, joined with spaces
fn read_keys(input: &mut dyn BufRead) -> io::Result<String> {
    let mut keys = Vec::new();
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            keys.push(line.to_string());
        }
    }
    Ok(keys.join(" "))
}

/// Drop trailing lines that are empty or whitespace only
pub fn trim_trailing_blank_lines(screen: &str) -> String {
    let lines: Vec<&str> = screen.split('\n').collect();
    match lines.iter().rposition(|line| !line.trim().is_empty()) {
        Some(last) => lines[..=last].join("\n"),
        None => String::new(),
    }
}

/// Render the final result (or all captures) in the requested format
pub fn format_output(
    result: &CaptureResult,
    multi: Option<&MultiCaptureResult>,
    format: OutputFormat,
) -> String {
    match (format, multi) {
        (OutputFormat::Json, Some(multi)) if !multi.captures.is_empty() => to_json(multi),
        (OutputFormat::Json, _) => to_json(result),
        (OutputFormat::Text, Some(multi)) if !multi.captures.is_empty() => {
            let mut text = String::new();
            for (i, capture) in multi.captures.iter().enumerate() {
                if i > 0 {
                    text.push_str(&format!("\n--- Capture {} ---\n", i));
                }
                text.push_str(&capture.screen);
            }
            text
        }
        (OutputFormat::Text, _) => result.screen.clone(),
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(mut json) => {
            json.push('\n');
            json
        }
        Err(err) => {
            warn!(error = %err, "failed to serialize capture");
            String::new()
        }
    }
}

fn emit(
    result: &CaptureResult,
    multi: Option<&MultiCaptureResult>,
    options: &CaptureOptions,
    out: &mut dyn Write,
) {
    let output = format_output(result, multi, options.format);
    match &options.output {
        Some(path) => {
            if let Err(err) = fs::write(path, output) {
                eprintln!("Error: writing to file {:?}: {}", path.display().to_string(), err);
            }
        }
        None => {
            if let Err(err) = out.write_all(output.as_bytes()).and_then(|()| out.flush()) {
                warn!(error = %err, "failed to write capture");
            }
        }
    }
}

/// Closes the session if the run outlives its deadline
struct Watchdog {
    fired: Arc<AtomicBool>,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn start(session: Arc<Session>, timeout: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let (cancel, cancelled) = mpsc::channel::<()>();

        let flag = Arc::clone(&fired);
        let handle = thread::Builder::new()
            .name("ptyshot-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                    warn!(?timeout, "overall timeout reached, closing session");
                    flag.store(true, Ordering::SeqCst);
                    session.close();
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to start timeout watchdog");
                None
            }
        };

        Self {
            fired,
            cancel: Some(cancel),
            handle,
        }
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Disconnecting wakes the thread
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(screen: &str) -> CaptureResult {
        CaptureResult {
            screen: screen.to_string(),
            cols: 10,
            rows: 2,
            cursor_row: 0,
            cursor_col: 3,
            cursor_visible: true,
            timestamp: Local::now(),
            command: "app --flag".to_string(),
            checks: None,
            timing: None,
        }
    }

    fn fast_options() -> CaptureOptions {
        CaptureOptions {
            delay: Duration::from_millis(100),
            stable_timeout: Duration::from_secs(2),
            stable_time: Duration::from_millis(100),
            input_delay: Duration::from_millis(20),
            ..CaptureOptions::default()
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn run_sh(script: &str, options: &CaptureOptions) -> (Outcome, String) {
        let mut out = Vec::new();
        let outcome = run_with("/bin/sh", &sh(script), options, &mut io::empty(), &mut out);
        (outcome, String::from_utf8_lossy(&out).into_owned())
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::Success.code(), 0);
        assert_eq!(Outcome::GeneralError.code(), 1);
        assert_eq!(Outcome::Timeout.code(), 2);
        assert_eq!(Outcome::AssertionFailed.code(), 3);
        assert_eq!(Outcome::CommandFailed.code(), 4);
    }

    #[test]
    fn test_trim_trailing_blank_lines() {
        assert_eq!(trim_trailing_blank_lines("a  \nb   \n    \n    \n"), "a  \nb   ");
        assert_eq!(trim_trailing_blank_lines("   \n   \n"), "");
        assert_eq!(trim_trailing_blank_lines("only"), "only");
    }

    #[test]
    fn test_read_keys_skips_blank_lines() {
        let mut input = io::Cursor::new("down\n\n  enter  \nctrl-c\n");
        assert_eq!(read_keys(&mut input).unwrap(), "down enter ctrl-c");
    }

    #[test]
    fn test_command_line() {
        assert_eq!(command_line("vim", &[]), "vim");
        assert_eq!(
            command_line("htop", &["-d".to_string(), "10".to_string()]),
            "htop -d 10"
        );
    }

    #[test]
    fn test_json_shape() {
        let mut result = sample("hi");
        result.timing = Some(TimingInfo {
            total_ms: 700,
            delay_ms: 500,
            ..TimingInfo::default()
        });
        let json = format_output(&result, None, OutputFormat::Json);
        assert!(json.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["screen"], "hi");
        assert_eq!(value["cols"], 10);
        assert_eq!(value["cursor_col"], 3);
        assert_eq!(value["cursor_visible"], true);
        assert_eq!(value["command"], "app --flag");
        assert_eq!(value["timing"]["total_ms"], 700);
        assert!(value["timing"].get("keys_ms").is_none());
        assert!(value.get("checks").is_none());
        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_text_capture_each_separators() {
        let multi = MultiCaptureResult {
            captures: vec![sample("one"), sample("two"), sample("three")],
            command: "app".to_string(),
            timing: None,
        };
        let text = format_output(&sample("three"), Some(&multi), OutputFormat::Text);
        assert_eq!(text, "one\n--- Capture 1 ---\ntwo\n--- Capture 2 ---\nthree");
    }

    #[test]
    fn test_multi_json_has_captures() {
        let multi = MultiCaptureResult {
            captures: vec![sample("a"), sample("b")],
            command: "app".to_string(),
            timing: Some(TimingInfo::default()),
        };
        let json = format_output(&sample("b"), Some(&multi), OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["captures"].as_array().unwrap().len(), 2);
        assert_eq!(value["command"], "app");
    }

    #[test]
    fn test_output_format_from_config_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            format: OutputFormat,
        }
        let wrapper: Wrapper = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(wrapper.format, OutputFormat::Json);
    }

    #[test]
    #[cfg(unix)]
    fn test_capture_with_trim() {
        let options = CaptureOptions {
            trim: true,
            ..fast_options()
        };
        let (outcome, out) = run_sh("printf 'line one\\r\\nline two'; sleep 10", &options);
        assert_eq!(outcome, Outcome::Success);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].trim_end(), "line one");
        assert_eq!(lines[1].trim_end(), "line two");
    }

    #[test]
    #[cfg(unix)]
    fn test_assertion_failure_still_prints() {
        let options = CaptureOptions {
            asserts: vec!["present".to_string(), "absent".to_string()],
            ..fast_options()
        };
        let (outcome, out) = run_sh("printf present; sleep 10", &options);
        assert_eq!(outcome, Outcome::AssertionFailed);
        assert!(out.contains("present"));
    }

    #[test]
    #[cfg(unix)]
    fn test_quiet_suppresses_output() {
        let options = CaptureOptions {
            quiet: true,
            asserts: vec!["ready".to_string()],
            ..fast_options()
        };
        let (outcome, out) = run_sh("printf ready; sleep 10", &options);
        assert_eq!(outcome, Outcome::Success);
        assert!(out.is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_checks_in_json() {
        let options = CaptureOptions {
            format: OutputFormat::Json,
            checks: vec!["alpha".to_string(), "omega".to_string()],
            ..fast_options()
        };
        let (outcome, out) = run_sh("printf alpha; sleep 10", &options);
        assert_eq!(outcome, Outcome::Success);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["checks"]["alpha"], true);
        assert_eq!(value["checks"]["omega"], false);
        assert_eq!(value["rows"], 24);
        assert_eq!(value["cols"], 80);
    }

    #[test]
    #[cfg(unix)]
    fn test_keys_reach_child() {
        let options = CaptureOptions {
            keys: "hello enter".to_string(),
            ..fast_options()
        };
        let mut out = Vec::new();
        let outcome = run_with("cat", &[], &options, &mut io::empty(), &mut out);
        assert_eq!(outcome, Outcome::Success);
        // Echoed by the tty and printed again by cat
        let text = String::from_utf8_lossy(&out);
        assert!(text.lines().filter(|l| l.trim_end() == "hello").count() >= 2);
    }

    #[test]
    #[cfg(unix)]
    fn test_keys_from_stdin_capture_each() {
        let options = CaptureOptions {
            keys_stdin: true,
            capture_each: true,
            format: OutputFormat::Json,
            ..fast_options()
        };
        let mut input = io::Cursor::new("a\n\nb\n");
        let mut out = Vec::new();
        let outcome = run_with("cat", &[], &options, &mut input, &mut out);
        assert_eq!(outcome, Outcome::Success);

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let captures = value["captures"].as_array().unwrap();
        assert_eq!(captures.len(), 3);
        assert!(captures[2]["screen"].as_str().unwrap().starts_with("ab"));
        assert!(value["timing"]["total_ms"].as_u64().is_some());
    }

    #[test]
    #[cfg(unix)]
    fn test_wait_for_timeout_is_general_error() {
        let options = CaptureOptions {
            wait_for: Some("never shown".to_string()),
            stable_timeout: Duration::from_millis(300),
            ..fast_options()
        };
        let (outcome, _) = run_sh("printf nothing; sleep 10", &options);
        assert_eq!(outcome, Outcome::GeneralError);
    }

    #[test]
    #[cfg(unix)]
    fn test_overall_timeout() {
        let options = CaptureOptions {
            wait_for: Some("never shown".to_string()),
            stable_timeout: Duration::from_secs(1),
            timeout: Duration::from_millis(200),
            ..fast_options()
        };
        let (outcome, _) = run_sh("sleep 10", &options);
        assert_eq!(outcome, Outcome::Timeout);
    }

    #[test]
    #[cfg(unix)]
    fn test_overall_timeout_with_hangup_ignoring_job() {
        let options = CaptureOptions {
            wait_for: Some("never shown".to_string()),
            stable_timeout: Duration::from_secs(1),
            timeout: Duration::from_millis(300),
            ..fast_options()
        };
        let started = Instant::now();
        let (outcome, _) = run_sh("trap '' HUP; sleep 20 & sleep 20", &options);
        assert_eq!(outcome, Outcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[cfg(unix)]
    fn test_command_failure_exit_code() {
        let (outcome, out) = run_sh("printf oops; exit 3", &fast_options());
        assert_eq!(outcome, Outcome::CommandFailed);
        assert!(out.starts_with("oops"));
    }

    #[test]
    fn test_missing_command_is_general_error() {
        let mut out = Vec::new();
        let outcome = run_with(
            "/nonexistent/ptyshot-missing",
            &[],
            &fast_options(),
            &mut io::empty(),
            &mut out,
        );
        assert_eq!(outcome, Outcome::GeneralError);
        assert!(out.is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.txt");
        let options = CaptureOptions {
            output: Some(path.clone()),
            trim: true,
            ..fast_options()
        };
        let (outcome, out) = run_sh("printf saved; sleep 10", &options);
        assert_eq!(outcome, Outcome::Success);
        assert!(out.is_empty());
        assert!(fs::read_to_string(&path).unwrap().starts_with("saved"));
    }
}

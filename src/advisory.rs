//! Log-driven diagnosis.
//!
//! Turns raw service log text into a short human-readable advisory via an
//! ordered table of pattern→message rules; the first match wins. Rules are
//! ordered most-specific first: a missing-module error mentions "not found",
//! so the module rule must sit above the generic not-found catch-all.

use std::sync::OnceLock;

use regex::Regex;

struct Rule {
    pattern: Regex,
    message: &'static str,
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let table: &[(&str, &str)] = &[
            (
                r"localStorage\.getItem is not a function",
                "This app accesses browser storage before the page loads. \
                 Wrap the affected code in  if (typeof window !== 'undefined') { … }",
            ),
            (
                r"EADDRINUSE|address already in use",
                "Something else is already using this port. \
                 Free the port first, or change the service to use a different one.",
            ),
            (
                r"MODULE_NOT_FOUND|Cannot find module|ModuleNotFoundError",
                "A required package is missing. \
                 Run  npm install  or  pip install -r requirements.txt  in the working copy.",
            ),
            (
                r"command not found|not found|No such file",
                "A command or file wasn't found. \
                 Check the start command is correct and all required tools are installed.",
            ),
            (
                r"EACCES|permission denied",
                "Permission denied. \
                 Try a port number above 1024, or check the folder's permissions.",
            ),
            (
                r"JavaScript heap out of memory|out of memory",
                "The service ran out of memory. \
                 Add  NODE_OPTIONS=--max-old-space-size=4096  before the start command.",
            ),
        ];
        table
            .iter()
            .map(|(pattern, message)| Rule {
                pattern: Regex::new(&format!("(?i){pattern}")).expect("static regex"),
                message,
            })
            .collect()
    })
}

/// Returns the advisory for the first matching rule, or an empty string when
/// nothing matches (the caller falls back to a generic message).
pub fn diagnose(log_text: &str) -> &'static str {
    for rule in rules() {
        if rule.pattern.is_match(log_text) {
            return rule.message;
        }
    }
    ""
}

/// True when the log carries the port-conflict signature. Used by the
/// supervisor to catch a service that reports healthy while another process
/// actually owns its port.
pub fn port_conflict(log_text: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)EADDRINUSE|address already in use").expect("static regex"))
        .is_match(log_text)
}

/// If the configured URL points at one port but the log says the service
/// came up on another, returns a hint naming both ports.
pub fn port_mismatch(url: &str, log_text: &str) -> Option<String> {
    static URL_PORT: OnceLock<Regex> = OnceLock::new();
    static LOG_PORT: OnceLock<Regex> = OnceLock::new();
    let url_port = URL_PORT
        .get_or_init(|| Regex::new(r":(\d+)").expect("static regex"))
        .captures(url)?;
    let log_port = LOG_PORT
        .get_or_init(|| Regex::new(r"localhost:(\d+)").expect("static regex"))
        .captures(log_text)?;
    let configured = url_port.get(1)?.as_str();
    let actual = log_port.get(1)?.as_str();
    if configured == actual {
        return None;
    }
    Some(format!(
        "Service is on :{actual}, not :{configured}. \
         Update the URL here, or change the port in the repo."
    ))
}

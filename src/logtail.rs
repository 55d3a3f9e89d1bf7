//! Reading service log files.
//!
//! Each service process writes interleaved stdout/stderr to one append-only
//! log file; this module reads it back for diagnosis. Reads are lossy so a
//! partial write near EOF (half an escape sequence, a torn UTF-8 code point)
//! never fails a tail, and ANSI color codes and `[prefix]` markers from dev
//! servers are stripped before the text is shown to the user.

use std::path::Path;

use regex::Regex;

/// Number of lines a log tail keeps by default.
pub const TAIL_LINES: usize = 8;

/// Reads the whole log as text; empty string if the file is missing or
/// unreadable.
pub fn read_log(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}

/// Reads the last `limit` meaningful lines of a service's log, cleaned of
/// escape sequences and line prefixes. Returns explicit fallback text when
/// the log is empty or unreadable so the caller always has something to show.
pub fn read_log_tail(path: &Path, name: &str, limit: usize) -> String {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return format!("{} exited unexpectedly", name),
    };
    let stripped = strip_ansi_escapes::strip(&bytes);
    let text = String::from_utf8_lossy(&stripped);

    let prefix = prefix_pattern();
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        let line = prefix.replace(raw, "").trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }

    let start = lines.len().saturating_sub(limit);
    let tail = &lines[start..];
    if tail.is_empty() {
        format!("{} exited (no log output)", name)
    } else {
        tail.join("\n")
    }
}

// Dev servers commonly prefix lines with "[name]" or "[HH:MM:SS]".
fn prefix_pattern() -> Regex {
    Regex::new(r"^\[[^\]]+\]\s*").expect("static regex")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_log(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stagehand.log");
        let mut file = std::fs::File::create(&path).expect("create log");
        file.write_all(content).expect("write log");
        (dir, path)
    }

    #[test]
    fn strips_ansi_and_prefixes_and_keeps_tail() {
        let mut content = Vec::new();
        for i in 0..12 {
            writeln!(content, "[web] \x1b[32mline {}\x1b[0m", i).unwrap();
        }
        let (_dir, path) = write_log(&content);
        let tail = read_log_tail(&path, "web", TAIL_LINES);
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), TAIL_LINES);
        assert_eq!(lines[0], "line 4");
        assert_eq!(lines[7], "line 11");
    }

    #[test]
    fn tolerates_invalid_utf8_near_eof() {
        let mut content = b"ready on port 3000\n".to_vec();
        content.extend_from_slice(&[0xff, 0xfe]);
        let (_dir, path) = write_log(&content);
        let tail = read_log_tail(&path, "web", TAIL_LINES);
        assert!(tail.contains("ready on port 3000"));
    }

    #[test]
    fn empty_log_yields_fallback() {
        let (_dir, path) = write_log(b"");
        assert_eq!(
            read_log_tail(&path, "web", TAIL_LINES),
            "web exited (no log output)"
        );
    }

    #[test]
    fn missing_log_yields_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nope.log");
        assert_eq!(
            read_log_tail(&path, "web", TAIL_LINES),
            "web exited unexpectedly"
        );
        assert_eq!(read_log(&path), "");
    }
}

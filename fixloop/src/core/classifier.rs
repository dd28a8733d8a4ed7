//! Deterministic classification of raw project output into [`ErrorEntry`] records.
//!
//! Classification is purely textual: the same text always yields the same
//! entries in the same order. Nothing that looks like an error is dropped;
//! lines that match no rule but carry an error marker become
//! [`ErrorCategory::Unknown`].

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::diagnosis::{ErrorCategory, ErrorEntry, Severity};

struct Rule {
    category: ErrorCategory,
    pattern: Regex,
}

/// Ordered signature table. The first matching rule wins for a line.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let table: [(ErrorCategory, &str); 13] = [
        (
            ErrorCategory::Port,
            r"(?i)EADDRINUSE|address already in use|port \d+ is (?:already )?in use|port is already allocated",
        ),
        (
            ErrorCategory::Dependency,
            r"ModuleNotFoundError|No module named|Cannot find module|Module not found|Cannot find package|npm ERR! missing|ERESOLVE|Could not resolve dependenc|No matching distribution found|[Cc]ommand not found|is not recognized as an internal or external command",
        ),
        (
            ErrorCategory::Import,
            r"ImportError|cannot import name|does not provide an export named|is not exported from|attempted relative import",
        ),
        (
            ErrorCategory::Syntax,
            r"SyntaxError|IndentationError|TabError|Unexpected token|Parsing error|[Ii]nvalid syntax|Unterminated|was never closed|unexpected EOF",
        ),
        (
            ErrorCategory::Database,
            r"OperationalError|IntegrityError|ProgrammingError|django\.db\.utils|sqlalchemy\.exc|psycopg2?\.|could not connect to server|ECONNREFUSED\s*\S*:(?:5432|3306|27017|6379)\b|MongoNetworkError|MongoServerSelectionError|SequelizeConnection|no such table|database is locked",
        ),
        (
            ErrorCategory::Network,
            r"ECONNREFUSED|ECONNRESET|ENOTFOUND|EAI_AGAIN|[Cc]onnection refused|ConnectionError|ConnectionRefusedError|[Nn]etwork error|getaddrinfo|socket hang up",
        ),
        (
            ErrorCategory::Timeout,
            r"ETIMEDOUT|TimeoutError|[Tt]imed out|Timeout of \d+ms exceeded|[Tt]imeout exceeded",
        ),
        (
            ErrorCategory::Permission,
            r"Permission denied|EACCES|EPERM|PermissionError|Access (?:is )?denied|Operation not permitted",
        ),
        (
            ErrorCategory::Memory,
            r"MemoryError|heap out of memory|JavaScript heap|OutOfMemory|ENOMEM|Cannot allocate memory",
        ),
        (
            ErrorCategory::Configuration,
            r"ImproperlyConfigured|[Cc]onfiguration error|[Ii]nvalid configuration|Environment variable \S+ (?:is )?not set|Missing required (?:env|environment|config)|\.env\b.*not found|NoAppException|Could not locate a Flask application|KeyError: '[A-Z][A-Z0-9_]+'",
        ),
        (
            ErrorCategory::Type,
            r"TypeError|is not a function|is not assignable to|Expected .+ but (?:got|received)|is not callable|unsupported operand type",
        ),
        (
            ErrorCategory::Logic,
            r"AssertionError|^\s*FAILED\s+\S+::|^(?:FAIL|ERROR): \w+ \(|\d+ failing|^\s*●\s",
        ),
        (
            ErrorCategory::Runtime,
            r"RuntimeError|ReferenceError|NameError|ValueError|KeyError|IndexError|AttributeError|ZeroDivisionError|RangeError|RecursionError|UnhandledPromiseRejection|Uncaught|panicked at|Segmentation fault|FileNotFoundError|ENOENT|No such file or directory|NullPointerException|Unhandled Runtime Error",
        ),
    ];
    table
        .into_iter()
        .map(|(category, pattern)| Rule {
            category,
            pattern: Regex::new(pattern).unwrap(),
        })
        .collect()
});

/// Lines that look like errors even though no rule matched.
static ERROR_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:Error|Exception)\b|\bERR!|\bFATAL\b|^fatal:").unwrap());
static TRACEBACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Traceback \(most recent call last\)").unwrap());
static PY_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap());
static JS_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?:.*?\()?([^\s()]+\.(?:js|mjs|cjs|jsx|ts|tsx)):(\d+)(?::\d+)?\)?\s*$")
        .unwrap()
});
static JS_FRAME_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s+at\s").unwrap());
static GENERIC_LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\w./\\-]+\.[A-Za-z]\w*):(\d+)").unwrap());
static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Classify raw stdout/stderr text into error entries.
pub fn classify(raw_text: &str) -> Vec<ErrorEntry> {
    let lines: Vec<&str> = raw_text.lines().collect();
    let mut entries = Vec::new();
    let mut traceback_start: Option<usize> = None;

    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if TRACEBACK_RE.is_match(trimmed) {
            if let Some(start) = traceback_start {
                // A new header closes the previous block without a terminal line.
                entries.push(unknown_for_block(&lines, start, idx));
            }
            traceback_start = Some(idx);
            continue;
        }
        let indented = line.starts_with(char::is_whitespace);
        if traceback_start.is_some() && indented {
            continue;
        }
        if is_frame_line(line) {
            continue;
        }

        let entry = classify_line(&lines, idx, traceback_start);
        if let Some(start) = traceback_start.take() {
            // A non-indented line ends the traceback block.
            match entry {
                Some(entry) => entries.push(entry),
                None => entries.push(
                    ErrorEntry::new(ErrorCategory::Unknown, trimmed)
                        .with_stack_trace(Some(lines[start..=idx].join("\n"))),
                ),
            }
            continue;
        }
        if let Some(entry) = entry {
            entries.push(entry);
        }
    }

    if let Some(start) = traceback_start {
        entries.push(unknown_for_block(&lines, start, lines.len()));
    }

    deduplicate(entries)
}

/// Count entries per category in deterministic (category) order.
pub fn category_counts(entries: &[ErrorEntry]) -> BTreeMap<ErrorCategory, usize> {
    let mut counts = BTreeMap::new();
    for entry in entries {
        *counts.entry(entry.category).or_insert(0) += 1;
    }
    counts
}

/// Short remediation guidance for a category.
pub fn guidance(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Syntax => &[
            "Check the indicated line for syntax errors",
            "Verify indentation and bracket matching",
        ],
        ErrorCategory::Dependency => &[
            "Install the missing package or run a fresh install",
            "Check the package name and version constraints",
        ],
        ErrorCategory::Import => &[
            "Verify the imported name exists in the target module",
            "Check the import path and for circular imports",
        ],
        ErrorCategory::Type => &[
            "Check the types of values passed to the failing call",
            "Look for undefined or null values",
        ],
        ErrorCategory::Configuration => &[
            "Check that .env exists with the required variables",
            "Verify configuration files are present",
        ],
        ErrorCategory::Network => &[
            "Check that the remote service is running and reachable",
            "Verify the host and port",
        ],
        ErrorCategory::Database => &[
            "Check that the database server is running",
            "Run pending migrations",
        ],
        ErrorCategory::Permission => &[
            "Check file and directory permissions",
            "Ensure the user has write access",
        ],
        ErrorCategory::Port => &[
            "Stop the process holding the port",
            "Configure a different port",
        ],
        ErrorCategory::Memory => &[
            "Increase the memory limit",
            "Look for unbounded data structures",
        ],
        ErrorCategory::Timeout => &[
            "Check for blocking calls or infinite loops",
            "Increase the timeout if the work is legitimately slow",
        ],
        ErrorCategory::Logic => &[
            "Review the failing assertions",
            "Compare expected and actual values",
        ],
        ErrorCategory::Runtime => &[
            "Inspect the stack trace for the failing call",
            "Check the values involved at the failing line",
        ],
        ErrorCategory::Unknown => &["Inspect the raw output around the reported line"],
    }
}

fn classify_line(lines: &[&str], idx: usize, traceback_start: Option<usize>) -> Option<ErrorEntry> {
    let line = lines[idx];
    let trimmed = line.trim();
    let category = RULES
        .iter()
        .find(|rule| rule.pattern.is_match(line))
        .map(|rule| rule.category)
        .or_else(|| ERROR_MARKER_RE.is_match(trimmed).then_some(ErrorCategory::Unknown))?;

    let (file, line_no) = extract_location(lines, idx);
    let stack_trace = extract_stack_trace(lines, idx, traceback_start);
    Some(
        ErrorEntry::new(category, trimmed)
            .with_location(file, line_no)
            .with_severity(severity_of(trimmed))
            .with_stack_trace(stack_trace),
    )
}

fn unknown_for_block(lines: &[&str], start: usize, end: usize) -> ErrorEntry {
    let header = lines[start].trim();
    let trace = lines[start..end].join("\n");
    let (file, line_no) = lines[start..end]
        .iter()
        .rev()
        .find_map(|l| python_frame(l))
        .map_or((None, None), |(f, n)| (Some(f), Some(n)));
    ErrorEntry::new(ErrorCategory::Unknown, header)
        .with_location(file, line_no)
        .with_stack_trace(Some(trace))
}

fn is_frame_line(line: &str) -> bool {
    (PY_FRAME_RE.is_match(line) && line.trim_start().starts_with("File \""))
        || JS_FRAME_LINE_RE.is_match(line)
}

fn severity_of(line: &str) -> Severity {
    let lower = line.to_lowercase();
    if lower.contains("warn") && !lower.contains("error") {
        Severity::Warning
    } else {
        Severity::Error
    }
}

fn python_frame(line: &str) -> Option<(String, u32)> {
    let caps = PY_FRAME_RE.captures(line)?;
    Some((caps[1].to_string(), caps[2].parse().ok()?))
}

fn js_frame(line: &str) -> Option<(String, u32)> {
    let caps = JS_FRAME_RE.captures(line)?;
    let file = &caps[1];
    if file.starts_with("node:") || file.contains("node_modules") {
        return None;
    }
    Some((file.to_string(), caps[2].parse().ok()?))
}

fn generic_location(line: &str) -> Option<(String, u32)> {
    let caps = GENERIC_LOCATION_RE.captures(line)?;
    Some((caps[1].to_string(), caps[2].parse().ok()?))
}

/// Find the file and line for the error at `idx`.
///
/// Order: the line itself, the nearest preceding Python frame, the first
/// following JavaScript frame, then a `file:line` header just above (Node
/// prints one before the offending source line).
fn extract_location(lines: &[&str], idx: usize) -> (Option<String>, Option<u32>) {
    let line = lines[idx];
    let found = python_frame(line)
        .or_else(|| js_frame(line))
        .or_else(|| generic_location(line))
        .or_else(|| {
            lines[idx.saturating_sub(6)..idx]
                .iter()
                .rev()
                .find_map(|l| python_frame(l))
        })
        .or_else(|| {
            lines[idx + 1..lines.len().min(idx + 11)]
                .iter()
                .find_map(|l| js_frame(l))
        })
        .or_else(|| {
            lines[idx.saturating_sub(3)..idx]
                .iter()
                .rev()
                .filter(|l| !l.starts_with(char::is_whitespace))
                .find_map(|l| generic_location(l))
        });
    match found {
        Some((file, line_no)) => (Some(file), Some(line_no)),
        None => (None, None),
    }
}

fn extract_stack_trace(lines: &[&str], idx: usize, traceback_start: Option<usize>) -> Option<String> {
    if let Some(start) = traceback_start {
        return Some(lines[start..=idx].join("\n"));
    }
    let following: Vec<&str> = lines[idx + 1..lines.len().min(idx + 21)]
        .iter()
        .copied()
        .take_while(|l| JS_FRAME_LINE_RE.is_match(l))
        .collect();
    if following.is_empty() {
        return None;
    }
    let mut trace = vec![lines[idx]];
    trace.extend(following);
    Some(trace.join("\n"))
}

/// Collapse entries of one category whose messages differ only in digits,
/// keeping the first.
fn deduplicate(entries: Vec<ErrorEntry>) -> Vec<ErrorEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| {
            let key = DIGITS_RE.replace_all(&entry.message, "N").into_owned();
            seen.insert((entry.category, key))
        })
        .collect()
}

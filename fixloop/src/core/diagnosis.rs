//! Classified problems and their recurrence signatures.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Category of a classified problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Syntax,
    Runtime,
    Dependency,
    Import,
    Type,
    Configuration,
    Network,
    Database,
    Permission,
    Port,
    Memory,
    Timeout,
    Logic,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Import => "import",
            ErrorCategory::Type => "type",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Network => "network",
            ErrorCategory::Database => "database",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Port => "port",
            ErrorCategory::Memory => "memory",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Logic => "logic",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One classified problem found in project output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub category: ErrorCategory,
    /// The matching output line, trimmed.
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub severity: Severity,
    /// Normalized recurrence key (see [`signature`]).
    pub signature: String,
    /// Stack trace lines surrounding the error, when present.
    pub stack_trace: Option<String>,
}

impl ErrorEntry {
    /// Build an entry, deriving its signature from category and message.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let message = message.into();
        let signature = signature(category, &message);
        Self {
            category,
            message,
            file: None,
            line: None,
            severity: Severity::Error,
            signature,
            stack_trace: None,
        }
    }

    pub fn with_location(mut self, file: Option<String>, line: Option<u32>) -> Self {
        self.file = file;
        self.line = line;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: Option<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    /// `file:line` when a location is known.
    pub fn location(&self) -> Option<String> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{file}:{line}")),
            (Some(file), None) => Some(file.clone()),
            _ => None,
        }
    }
}

static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+|\b[0-9a-f]{8,}\b").unwrap());
static ABS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:[A-Za-z]:\\|/)[^\s'"():,]+"#).unwrap());
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Reduce a message to its shape: variable tokens (addresses, absolute paths,
/// numbers such as PIDs and ports) are replaced by placeholders.
pub fn message_shape(message: &str) -> String {
    let shape = HEX_RE.replace_all(message, "<hex>");
    let shape = ABS_PATH_RE.replace_all(&shape, |caps: &regex::Captures<'_>| {
        // Keep the file name so different files stay distinct.
        let path = &caps[0];
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        format!("<path>/{name}")
    });
    let shape = NUMBER_RE.replace_all(&shape, "<n>");
    let shape = SPACE_RE.replace_all(shape.trim(), " ");
    shape.to_lowercase()
}

/// Recurrence key for an error: `<category>:<16 hex chars>`.
///
/// Two entries with equal signatures are the same error across cycles even
/// when their surface text differs in PIDs, ports, addresses or temp paths.
pub fn signature(category: ErrorCategory, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(message_shape(message).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}:{}", category.as_str(), &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_pids_and_ports() {
        let a = signature(
            ErrorCategory::Port,
            "Error: listen EADDRINUSE: address already in use :::3000 (pid 4411)",
        );
        let b = signature(
            ErrorCategory::Port,
            "Error: listen EADDRINUSE: address already in use :::3001 (pid 9120)",
        );
        assert_eq!(a, b);
        assert!(a.starts_with("port:"));
        assert_eq!(a.len(), "port:".len() + 16);
    }

    #[test]
    fn signature_distinguishes_module_names() {
        let flask = signature(
            ErrorCategory::Dependency,
            "ModuleNotFoundError: No module named 'flask'",
        );
        let requests = signature(
            ErrorCategory::Dependency,
            "ModuleNotFoundError: No module named 'requests'",
        );
        assert_ne!(flask, requests);
    }

    #[test]
    fn signature_depends_on_category() {
        let msg = "something broke";
        assert_ne!(
            signature(ErrorCategory::Runtime, msg),
            signature(ErrorCategory::Unknown, msg)
        );
    }

    #[test]
    fn shape_strips_temp_directories_but_keeps_file_names() {
        let shape = message_shape("File \"/tmp/.tmpA1b2/app.py\", line 10");
        assert_eq!(shape, "file \"<path>/app.py\", line <n>");
    }

    #[test]
    fn location_formats_file_and_line() {
        let entry = ErrorEntry::new(ErrorCategory::Syntax, "SyntaxError: invalid syntax")
            .with_location(Some("app.py".to_string()), Some(10));
        assert_eq!(entry.location().as_deref(), Some("app.py:10"));
    }
}
